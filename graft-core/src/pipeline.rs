//! The pipeline abstraction: a typed registry of compilable slots.

use std::collections::HashMap;

use candle_core::Tensor;

use crate::error::{Error, Result};
use crate::graph::DeployableModule;
use crate::module::PipelineModule;
use crate::offload::{OffloadHook, PipelineComponent};
use crate::slots::Slot;

/// What a slot currently holds: the plain module, or the module wrapped in a
/// deployable bound to a graph backend.
pub enum SlotModule {
    Plain(Box<dyn PipelineModule>),
    Compiled(DeployableModule),
}

impl SlotModule {
    pub fn forward(&mut self, inputs: &[Tensor]) -> Result<Tensor> {
        match self {
            SlotModule::Plain(module) => module.forward(inputs),
            SlotModule::Compiled(module) => module.forward(inputs),
        }
    }

    /// Whether the slot holds a deployable with a materialized graph.
    pub fn is_compiled(&self) -> bool {
        match self {
            SlotModule::Plain(_) => false,
            SlotModule::Compiled(module) => module.is_compiled(),
        }
    }

    pub fn as_deployable(&self) -> Option<&DeployableModule> {
        match self {
            SlotModule::Plain(_) => None,
            SlotModule::Compiled(module) => Some(module),
        }
    }

    pub fn as_deployable_mut(&mut self) -> Option<&mut DeployableModule> {
        match self {
            SlotModule::Plain(_) => None,
            SlotModule::Compiled(module) => Some(module),
        }
    }

    /// The underlying module, unwrapping the deployable if there is one.
    pub fn module_mut(&mut self) -> &mut dyn PipelineModule {
        match self {
            SlotModule::Plain(module) => module.as_mut(),
            SlotModule::Compiled(module) => module.module_mut(),
        }
    }
}

/// Post-processing stage that turns decoded latents into images. The patch
/// swaps its tensor conversion for one that understands compiled outputs;
/// patching must be idempotent since compile and load both apply it.
pub trait ImageProcessor {
    fn patch(&mut self);

    fn is_patched(&self) -> bool;
}

/// A pipeline holding compilable submodules in typed slots.
///
/// Slot access distinguishes "slot unsupported by this pipeline kind"
/// (`set` returns an error) from "slot supported but empty" (`get` returns
/// `None`); compilation and caching skip the latter silently.
pub trait Pipeline {
    fn get(&self, slot: Slot) -> Option<&SlotModule>;

    fn get_mut(&mut self, slot: Slot) -> Option<&mut SlotModule>;

    fn take(&mut self, slot: Slot) -> Option<SlotModule>;

    fn set(&mut self, slot: Slot, module: SlotModule) -> Result<()>;

    fn image_processor_mut(&mut self) -> Option<&mut dyn ImageProcessor> {
        None
    }

    /// Visits every named component that may carry an offload hook.
    fn for_each_component(&mut self, _f: &mut dyn FnMut(&str, &mut dyn PipelineComponent)) {}

    fn enable_model_cpu_offload(&mut self) {}

    fn enable_sequential_cpu_offload(&mut self) {}
}

/// Reference image processor: patching just flips a flag.
#[derive(Debug, Default)]
pub struct ReferenceImageProcessor {
    patched: bool,
}

impl ImageProcessor for ReferenceImageProcessor {
    fn patch(&mut self) {
        self.patched = true;
    }

    fn is_patched(&self) -> bool {
        self.patched
    }
}

/// Reference component: remembers which offload hook is installed on it.
#[derive(Debug, Default)]
pub struct ReferenceComponent {
    hook: Option<OffloadHook>,
}

impl ReferenceComponent {
    pub fn new(hook: Option<OffloadHook>) -> Self {
        Self { hook }
    }
}

impl PipelineComponent for ReferenceComponent {
    fn offload_hook(&self) -> Option<OffloadHook> {
        self.hook
    }

    fn remove_offload_hook(&mut self) {
        self.hook = None;
    }
}

/// Reference pipeline backed by a slot map.
#[derive(Default)]
pub struct SlotPipeline {
    supported: Vec<Slot>,
    modules: HashMap<Slot, SlotModule>,
    image_processor: Option<ReferenceImageProcessor>,
    components: Vec<(String, ReferenceComponent)>,
    model_offload_enabled: bool,
    sequential_offload_enabled: bool,
}

impl SlotPipeline {
    /// A pipeline supporting every slot.
    pub fn new() -> Self {
        Self::with_slots(&Slot::ALL)
    }

    /// A pipeline supporting only the given slots, the way pipeline kinds
    /// differ in which submodules they carry.
    pub fn with_slots(slots: &[Slot]) -> Self {
        Self {
            supported: slots.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_image_processor(mut self) -> Self {
        self.image_processor = Some(ReferenceImageProcessor::default());
        self
    }

    pub fn add_component(&mut self, name: impl Into<String>, hook: Option<OffloadHook>) {
        self.components.push((name.into(), ReferenceComponent::new(hook)));
    }

    /// Puts a plain module into a slot.
    pub fn install(&mut self, slot: Slot, module: Box<dyn PipelineModule>) -> Result<()> {
        self.set(slot, SlotModule::Plain(module))
    }

    pub fn image_processor(&self) -> Option<&ReferenceImageProcessor> {
        self.image_processor.as_ref()
    }

    pub fn component_hook(&self, name: &str) -> Option<OffloadHook> {
        self.components
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, c)| c.offload_hook())
    }

    pub fn model_offload_enabled(&self) -> bool {
        self.model_offload_enabled
    }

    pub fn sequential_offload_enabled(&self) -> bool {
        self.sequential_offload_enabled
    }
}

impl Pipeline for SlotPipeline {
    fn get(&self, slot: Slot) -> Option<&SlotModule> {
        self.modules.get(&slot)
    }

    fn get_mut(&mut self, slot: Slot) -> Option<&mut SlotModule> {
        self.modules.get_mut(&slot)
    }

    fn take(&mut self, slot: Slot) -> Option<SlotModule> {
        self.modules.remove(&slot)
    }

    fn set(&mut self, slot: Slot, module: SlotModule) -> Result<()> {
        if !self.supported.contains(&slot) {
            return Err(Error::MissingSlot(slot));
        }
        self.modules.insert(slot, module);
        Ok(())
    }

    fn image_processor_mut(&mut self) -> Option<&mut dyn ImageProcessor> {
        self.image_processor
            .as_mut()
            .map(|p| p as &mut dyn ImageProcessor)
    }

    fn for_each_component(&mut self, f: &mut dyn FnMut(&str, &mut dyn PipelineComponent)) {
        for (name, component) in &mut self.components {
            f(name, component);
        }
    }

    fn enable_model_cpu_offload(&mut self) {
        self.model_offload_enabled = true;
        for (_, component) in &mut self.components {
            component.hook = Some(OffloadHook::ModelCpu);
        }
    }

    fn enable_sequential_cpu_offload(&mut self) {
        self.sequential_offload_enabled = true;
        for (_, component) in &mut self.components {
            component.hook = Some(OffloadHook::Sequential);
        }
    }
}
