//! Weight fusers: how a grouped LoRA update lands in a layer's weights.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::layers::{Conv2dWeights, LinearWeights};

pub const LORA_DOWN_KEY: &str = "lora.down.weight";
pub const LORA_UP_KEY: &str = "lora.up.weight";

/// Knobs for one fusion pass.
#[derive(Debug, Clone)]
pub struct FuseOptions {
    /// Global multiplier applied on top of the per-group alpha scaling.
    pub lora_scale: f64,
    /// Where original weights are stashed so the fuse can be undone.
    pub offload_device: Device,
    /// Lets a fuser reuse deltas it has already computed for a layer.
    pub use_cache: bool,
}

impl Default for FuseOptions {
    fn default() -> Self {
        Self {
            lora_scale: 1.0,
            offload_device: Device::Cpu,
            use_cache: false,
        }
    }
}

/// Everything a fuser needs to fuse one grouped update into one layer.
pub struct FuseParams<'a> {
    /// Dotted path of the target layer, which also keys any fuser cache.
    pub path: &'a str,
    /// The group's sub-keys, `lora.down.weight` and friends.
    pub group: &'a HashMap<String, Tensor>,
    pub lora_scale: f64,
    /// Network alpha mapped to this group, if the file carried one.
    pub alpha: Option<f64>,
    /// Leading dimension of the down projection.
    pub rank: usize,
    pub offload_device: &'a Device,
    pub adapter_name: &'a str,
    pub use_cache: bool,
}

/// The fusion strategy injected into the loader.
///
/// Implementations must back up the layer's weight (via
/// [`LinearWeights::backup_weight`] or [`Conv2dWeights::backup_weight`])
/// before the first mutation so `unfuse_lora` can restore it.
pub trait WeightFuser {
    fn fuse_linear(&self, layer: &mut LinearWeights, params: &FuseParams<'_>) -> Result<()>;

    fn fuse_conv2d(&self, layer: &mut Conv2dWeights, params: &FuseParams<'_>) -> Result<()>;
}

/// Reference fuser: adds `lora_scale * (alpha / rank | 1) * (up @ down)` to
/// the base weight. Deltas are computed in f32 and cast back to the weight's
/// dtype; `use_cache` is accepted but the delta is recomputed every time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeltaFuser;

impl DeltaFuser {
    fn delta(&self, params: &FuseParams<'_>, target_dims: &[usize], dtype: DType) -> Result<Tensor> {
        let down = params.group.get(LORA_DOWN_KEY).ok_or_else(|| {
            Error::IncompleteLoraGroup {
                path: params.path.to_string(),
                key: LORA_DOWN_KEY,
            }
        })?;
        let up = params.group.get(LORA_UP_KEY).ok_or_else(|| {
            Error::IncompleteLoraGroup {
                path: params.path.to_string(),
                key: LORA_UP_KEY,
            }
        })?;
        let alpha_scale = params.alpha.map_or(1.0, |alpha| alpha / params.rank as f64);
        let scale = params.lora_scale * alpha_scale;

        // Conv projections come in as [rank, in, kh, kw] and [out, rank, 1, 1];
        // flattening them makes the linear and conv cases one matmul.
        let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
        let delta = (up.matmul(&down)? * scale)?;
        Ok(delta.reshape(target_dims.to_vec())?.to_dtype(dtype)?)
    }
}

impl WeightFuser for DeltaFuser {
    fn fuse_linear(&self, layer: &mut LinearWeights, params: &FuseParams<'_>) -> Result<()> {
        let delta = self.delta(params, layer.weight().dims(), layer.weight().dtype())?;
        layer.backup_weight(params.offload_device)?;
        let fused = (layer.weight() + &delta)?;
        layer.set_weight(fused);
        Ok(())
    }

    fn fuse_conv2d(&self, layer: &mut Conv2dWeights, params: &FuseParams<'_>) -> Result<()> {
        let delta = self.delta(params, layer.weight().dims(), layer.weight().dtype())?;
        layer.backup_weight(params.offload_device)?;
        let fused = (layer.weight() + &delta)?;
        layer.set_weight(fused);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params<'a>(
        group: &'a HashMap<String, Tensor>,
        lora_scale: f64,
        alpha: Option<f64>,
        rank: usize,
        device: &'a Device,
    ) -> FuseParams<'a> {
        FuseParams {
            path: "down_blocks.0.proj",
            group,
            lora_scale,
            alpha,
            rank,
            offload_device: device,
            adapter_name: "default_0",
            use_cache: false,
        }
    }

    fn ones_group(rank: usize, in_f: usize, out_f: usize) -> HashMap<String, Tensor> {
        let device = Device::Cpu;
        let mut group = HashMap::new();
        group.insert(
            LORA_DOWN_KEY.to_string(),
            Tensor::ones((rank, in_f), DType::F32, &device).unwrap(),
        );
        group.insert(
            LORA_UP_KEY.to_string(),
            Tensor::ones((out_f, rank), DType::F32, &device).unwrap(),
        );
        group
    }

    fn weight_values(layer: &LinearWeights) -> Vec<f32> {
        layer
            .weight()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
    }

    #[test]
    fn test_linear_delta_is_scaled_up_times_down() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let mut layer = LinearWeights::new(weight, None);

        // All-ones projections of rank 2: every delta element is the rank.
        let group = ones_group(2, 4, 3);
        DeltaFuser
            .fuse_linear(&mut layer, &params(&group, 1.0, None, 2, &device))
            .unwrap();

        assert!(weight_values(&layer).iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_alpha_rescales_the_delta_by_alpha_over_rank() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let mut layer = LinearWeights::new(weight, None);

        let group = ones_group(2, 4, 3);
        DeltaFuser
            .fuse_linear(&mut layer, &params(&group, 0.5, Some(8.0), 2, &device))
            .unwrap();

        // rank * lora_scale * alpha / rank = 2 * 0.5 * 4
        assert!(weight_values(&layer).iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_conv_projections_are_flattened_and_reshaped() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((2, 3, 3, 3), DType::F32, &device).unwrap();
        let mut layer = Conv2dWeights::new(weight, None, 1, 1);

        let mut group = HashMap::new();
        group.insert(
            LORA_DOWN_KEY.to_string(),
            Tensor::ones((2, 3, 3, 3), DType::F32, &device).unwrap(),
        );
        group.insert(
            LORA_UP_KEY.to_string(),
            Tensor::ones((2, 2, 1, 1), DType::F32, &device).unwrap(),
        );

        let params = FuseParams {
            path: "mid_block.conv",
            group: &group,
            lora_scale: 1.0,
            alpha: None,
            rank: 2,
            offload_device: &device,
            adapter_name: "default_0",
            use_cache: false,
        };
        DeltaFuser.fuse_conv2d(&mut layer, &params).unwrap();

        assert_eq!(layer.weight().dims(), &[2, 3, 3, 3]);
        let values = layer
            .weight()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(values.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_delta_is_cast_to_the_weight_dtype() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((3, 4), DType::F16, &device).unwrap();
        let mut layer = LinearWeights::new(weight, None);

        let group = ones_group(2, 4, 3);
        DeltaFuser
            .fuse_linear(&mut layer, &params(&group, 1.0, None, 2, &device))
            .unwrap();

        assert_eq!(layer.weight().dtype(), DType::F16);
        let values = layer
            .weight()
            .to_dtype(DType::F32)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(values.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_missing_up_projection_is_reported_with_the_layer_path() {
        let device = Device::Cpu;
        let weight = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let mut layer = LinearWeights::new(weight, None);

        let mut group = ones_group(2, 4, 3);
        group.remove(LORA_UP_KEY);
        let err = DeltaFuser
            .fuse_linear(&mut layer, &params(&group, 1.0, None, 2, &device))
            .unwrap_err();
        match err {
            Error::IncompleteLoraGroup { path, key } => {
                assert_eq!(path, "down_blocks.0.proj");
                assert_eq!(key, LORA_UP_KEY);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The failed fuse must not have touched the weight.
        assert!(weight_values(&layer).iter().all(|&v| v == 0.0));
    }
}
