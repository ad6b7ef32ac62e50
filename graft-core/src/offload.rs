//! CPU-offload hooks and the bookkeeping around weight mutation.
//!
//! Offload hooks move component weights between devices around each call.
//! Fusing LoRA weights while a hook could swap the weights out from under the
//! mutation is unsafe, so hooks are removed first and the offload mode is
//! re-enabled afterwards.

use tracing::info;

use crate::pipeline::Pipeline;

/// The offload strategies a component hook can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadHook {
    /// Whole submodules hop to the GPU for their call and back to CPU after.
    ModelCpu,
    /// Weights stream in layer by layer; slower, smallest footprint.
    Sequential,
}

impl OffloadHook {
    pub fn name(&self) -> &'static str {
        match self {
            OffloadHook::ModelCpu => "model_cpu",
            OffloadHook::Sequential => "sequential",
        }
    }
}

/// A named pipeline component that may carry an offload hook.
pub trait PipelineComponent {
    fn offload_hook(&self) -> Option<OffloadHook>;

    fn remove_offload_hook(&mut self);
}

/// Strips offload hooks from every component, returning the mode to restore
/// afterwards. Model offload wins when components disagree, since re-enabling
/// it subsumes the sequential hooks.
pub fn remove_offload_hooks(pipe: &mut dyn Pipeline) -> Option<OffloadHook> {
    let mut seen: Option<OffloadHook> = None;
    pipe.for_each_component(&mut |name, component| {
        if let Some(hook) = component.offload_hook() {
            info!(
                component = name,
                hook = hook.name(),
                "removing offload hook before weight mutation"
            );
            component.remove_offload_hook();
            seen = match (seen, hook) {
                (Some(OffloadHook::ModelCpu), _) | (_, OffloadHook::ModelCpu) => {
                    Some(OffloadHook::ModelCpu)
                }
                _ => Some(OffloadHook::Sequential),
            };
        }
    });
    seen
}

/// Re-enables the offload mode captured by [`remove_offload_hooks`].
pub fn restore_offload(pipe: &mut dyn Pipeline, hook: Option<OffloadHook>) {
    match hook {
        Some(OffloadHook::ModelCpu) => {
            info!("re-enabling model cpu offload");
            pipe.enable_model_cpu_offload();
        }
        Some(OffloadHook::Sequential) => {
            info!("re-enabling sequential cpu offload");
            pipe.enable_sequential_cpu_offload();
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SlotPipeline;

    #[test]
    fn test_removing_hooks_reports_the_mode_and_clears_components() {
        let mut pipe = SlotPipeline::new();
        pipe.add_component("unet", Some(OffloadHook::Sequential));
        pipe.add_component("vae", Some(OffloadHook::Sequential));

        let seen = remove_offload_hooks(&mut pipe);
        assert_eq!(seen, Some(OffloadHook::Sequential));
        assert!(pipe.component_hook("unet").is_none());
        assert!(pipe.component_hook("vae").is_none());
    }

    #[test]
    fn test_model_offload_wins_over_sequential() {
        let mut pipe = SlotPipeline::new();
        pipe.add_component("unet", Some(OffloadHook::ModelCpu));
        pipe.add_component("vae", Some(OffloadHook::Sequential));
        assert_eq!(remove_offload_hooks(&mut pipe), Some(OffloadHook::ModelCpu));

        let mut pipe = SlotPipeline::new();
        pipe.add_component("unet", Some(OffloadHook::Sequential));
        pipe.add_component("vae", Some(OffloadHook::ModelCpu));
        assert_eq!(remove_offload_hooks(&mut pipe), Some(OffloadHook::ModelCpu));
    }

    #[test]
    fn test_unhooked_pipeline_reports_nothing_to_restore() {
        let mut pipe = SlotPipeline::new();
        pipe.add_component("unet", None);
        assert_eq!(remove_offload_hooks(&mut pipe), None);
    }

    #[test]
    fn test_restore_reenables_the_captured_mode() {
        let mut pipe = SlotPipeline::new();
        restore_offload(&mut pipe, Some(OffloadHook::ModelCpu));
        assert!(pipe.model_offload_enabled());
        assert!(!pipe.sequential_offload_enabled());

        let mut pipe = SlotPipeline::new();
        restore_offload(&mut pipe, Some(OffloadHook::Sequential));
        assert!(pipe.sequential_offload_enabled());

        let mut pipe = SlotPipeline::new();
        restore_offload(&mut pipe, None);
        assert!(!pipe.model_offload_enabled());
        assert!(!pipe.sequential_offload_enabled());
    }
}
