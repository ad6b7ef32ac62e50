//! Reading LoRA weight files.
//!
//! A LoRA safetensors file mixes weight tensors with scalar `.alpha` entries.
//! The reader splits the two: weights keep their stored dtype and go into the
//! state dict, alphas are extracted to plain floats keyed by their full name.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use tracing::debug;

use crate::error::Result;
use crate::lora::{LoraStateDict, NetworkAlphas};

/// Reads a safetensors file into a state dict and its network alphas.
pub fn read_state_dict(
    path: impl AsRef<Path>,
    device: &Device,
) -> Result<(LoraStateDict, NetworkAlphas)> {
    let path = path.as_ref();
    let data = std::fs::read(path)?;
    let tensors = SafeTensors::deserialize(&data)?;

    let mut state_dict: LoraStateDict = HashMap::new();
    let mut network_alphas: NetworkAlphas = HashMap::new();
    for (name, view) in tensors.tensors() {
        let tensor = tensor_from_view(&view, device)?;
        if name.ends_with(".alpha") {
            network_alphas.insert(name, alpha_value(&tensor)?);
        } else {
            state_dict.insert(name, tensor);
        }
    }
    debug!(
        file = %path.display(),
        tensors = state_dict.len(),
        alphas = network_alphas.len(),
        "read LoRA state dict"
    );
    Ok((state_dict, network_alphas))
}

fn tensor_from_view(view: &safetensors::tensor::TensorView<'_>, device: &Device) -> Result<Tensor> {
    let shape = view.shape().to_vec();
    let data = view.data();
    let tensor = match view.dtype() {
        safetensors::Dtype::F32 => {
            let values: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::F16 => {
            let values: Vec<half::f16> = data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        safetensors::Dtype::BF16 => {
            let values: Vec<half::bf16> = data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]))
                .collect();
            Tensor::from_vec(values, shape, device)?
        }
        other => {
            return Err(candle_core::Error::msg(format!(
                "unsupported LoRA tensor dtype {other:?}"
            ))
            .into())
        }
    };
    Ok(tensor)
}

fn alpha_value(tensor: &Tensor) -> Result<f64> {
    let values = tensor
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    match values.as_slice() {
        [value] => Ok(*value as f64),
        _ => Err(candle_core::Error::msg(format!(
            "alpha tensors must hold a single scalar, got {} values",
            values.len()
        ))
        .into()),
    }
}
