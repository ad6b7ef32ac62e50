//! The module abstraction that pipeline slots hold and backends compile.

use std::any::Any;

use candle_core::Tensor;

use crate::error::Result;
use crate::layers::{Layer, LayerMut};
use crate::lora::{AdapterRegistry, LoraTarget};

/// A submodule that can be run, and optionally fused with LoRA weights.
///
/// `as_any` exists so graph backends can downcast to the concrete module
/// type when lowering it.
pub trait PipelineModule: Send {
    fn forward(&mut self, inputs: &[Tensor]) -> Result<Tensor>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// The module's LoRA surface, if it has one.
    fn as_lora_target(&mut self) -> Option<&mut dyn LoraTarget> {
        None
    }
}

/// An ordered stack of named layers, applied in sequence to the first input.
///
/// Layer names are dotted paths so LoRA state-dict keys resolve against them
/// directly. Extra inputs are accepted and ignored, which lets callers pass
/// conditioning tensors the way full models take them.
#[derive(Debug, Default)]
pub struct LayerStack {
    layers: Vec<(String, Layer)>,
    adapters: AdapterRegistry,
}

impl LayerStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, layer: impl Into<Layer>) -> &mut Self {
        self.layers.push((name.into(), layer.into()));
        self
    }

    pub fn layer(&self, path: &str) -> Option<&Layer> {
        self.layers
            .iter()
            .find(|(name, _)| name == path)
            .map(|(_, layer)| layer)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl PipelineModule for LayerStack {
    fn forward(&mut self, inputs: &[Tensor]) -> Result<Tensor> {
        let mut x = inputs
            .first()
            .ok_or_else(|| candle_core::Error::msg("forward expects at least one input"))?
            .clone();
        for (_, layer) in &self.layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_lora_target(&mut self) -> Option<&mut dyn LoraTarget> {
        Some(self)
    }
}

impl LoraTarget for LayerStack {
    fn layer_mut(&mut self, path: &str) -> Option<LayerMut<'_>> {
        self.layers
            .iter_mut()
            .find(|(name, _)| name == path)
            .map(|(_, layer)| layer.classify_mut())
    }

    fn for_each_layer_mut(&mut self, f: &mut dyn FnMut(&str, LayerMut<'_>)) {
        for (name, layer) in &mut self.layers {
            f(name, layer.classify_mut());
        }
    }

    fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    fn adapters_mut(&mut self) -> &mut AdapterRegistry {
        &mut self.adapters
    }
}
