//! Weight-bearing layers that LoRA updates can be fused into.

use candle_core::{Device, Tensor};

use crate::error::Result;

/// A dense layer holding `weight` of shape `[out, in]` and an optional bias.
#[derive(Debug, Clone)]
pub struct LinearWeights {
    weight: Tensor,
    bias: Option<Tensor>,
    original: Option<Tensor>,
}

impl LinearWeights {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            weight,
            bias,
            original: None,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn set_weight(&mut self, weight: Tensor) {
        self.weight = weight;
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(bias)?),
            None => Ok(y),
        }
    }

    /// Stashes the current weight on `device` so a later fuse can be undone.
    /// Only the first call takes a backup; later calls keep the original.
    pub fn backup_weight(&mut self, device: &Device) -> Result<()> {
        if self.original.is_none() {
            self.original = Some(self.weight.to_device(device)?);
        }
        Ok(())
    }

    /// Puts the stashed weight back, returning whether anything was restored.
    pub fn restore_weight(&mut self) -> Result<bool> {
        match self.original.take() {
            Some(original) => {
                let device = self.weight.device().clone();
                self.weight = original.to_device(&device)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A 2-D convolution holding `weight` of shape `[out, in, kh, kw]`.
#[derive(Debug, Clone)]
pub struct Conv2dWeights {
    weight: Tensor,
    bias: Option<Tensor>,
    padding: usize,
    stride: usize,
    original: Option<Tensor>,
}

impl Conv2dWeights {
    pub fn new(weight: Tensor, bias: Option<Tensor>, padding: usize, stride: usize) -> Self {
        Self {
            weight,
            bias,
            padding,
            stride,
            original: None,
        }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn set_weight(&mut self, weight: Tensor) {
        self.weight = weight;
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.conv2d(&self.weight, self.padding, self.stride, 1, 1)?;
        match &self.bias {
            Some(bias) => {
                let bias = bias.reshape((1, bias.dim(0)?, 1, 1))?;
                Ok(y.broadcast_add(&bias)?)
            }
            None => Ok(y),
        }
    }

    pub fn backup_weight(&mut self, device: &Device) -> Result<()> {
        if self.original.is_none() {
            self.original = Some(self.weight.to_device(device)?);
        }
        Ok(())
    }

    pub fn restore_weight(&mut self) -> Result<bool> {
        match self.original.take() {
            Some(original) => {
                let device = self.weight.device().clone();
                self.weight = original.to_device(&device)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// A token embedding table of shape `[vocab, dim]`. Embeddings carry weights
/// but are not a fusion target.
#[derive(Debug, Clone)]
pub struct EmbeddingWeights {
    weight: Tensor,
}

impl EmbeddingWeights {
    pub fn new(weight: Tensor) -> Self {
        Self { weight }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        Ok(self.weight.index_select(&ids.flatten_all()?, 0)?)
    }
}

/// A named layer inside a fusable module.
///
/// The `Adapter*` variants model layers whose trainable adapter lives outside
/// the base weights; fusion writes through to the wrapped base layer.
#[derive(Debug, Clone)]
pub enum Layer {
    Linear(LinearWeights),
    Conv2d(Conv2dWeights),
    AdapterLinear { base: LinearWeights },
    AdapterConv2d { base: Conv2dWeights },
    Embedding(EmbeddingWeights),
}

impl Layer {
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Linear(_) => "linear",
            Layer::Conv2d(_) => "conv2d",
            Layer::AdapterLinear { .. } => "adapter linear",
            Layer::AdapterConv2d { .. } => "adapter conv2d",
            Layer::Embedding(_) => "embedding",
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Layer::Linear(layer) | Layer::AdapterLinear { base: layer } => layer.forward(x),
            Layer::Conv2d(layer) | Layer::AdapterConv2d { base: layer } => layer.forward(x),
            Layer::Embedding(layer) => layer.forward(x),
        }
    }

    /// Classifies the layer for fusion, handing out the mutable weights when
    /// the layer kind supports it.
    pub fn classify_mut(&mut self) -> LayerMut<'_> {
        match self {
            Layer::Linear(layer) => LayerMut::Linear(layer),
            Layer::Conv2d(layer) => LayerMut::Conv2d(layer),
            Layer::AdapterLinear { base } => LayerMut::AdapterLinear(base),
            Layer::AdapterConv2d { base } => LayerMut::AdapterConv2d(base),
            Layer::Embedding(_) => LayerMut::Unsupported { kind: "embedding" },
        }
    }
}

impl From<LinearWeights> for Layer {
    fn from(layer: LinearWeights) -> Self {
        Layer::Linear(layer)
    }
}

impl From<Conv2dWeights> for Layer {
    fn from(layer: Conv2dWeights) -> Self {
        Layer::Conv2d(layer)
    }
}

impl From<EmbeddingWeights> for Layer {
    fn from(layer: EmbeddingWeights) -> Self {
        Layer::Embedding(layer)
    }
}

/// The closed set of fusion outcomes for a classified layer.
pub enum LayerMut<'a> {
    Linear(&'a mut LinearWeights),
    Conv2d(&'a mut Conv2dWeights),
    AdapterLinear(&'a mut LinearWeights),
    AdapterConv2d(&'a mut Conv2dWeights),
    Unsupported { kind: &'static str },
}
