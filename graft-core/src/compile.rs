//! Pipeline-level compilation and graph caching.
//!
//! `compile_pipe` wraps each populated slot in a deployable bound to a graph
//! backend. `save_pipe` and `load_pipe` move the materialized graphs to and
//! from a cache directory, one artifact per slot, named by the slot's dotted
//! path. All three walk the slots in compilation order and skip what is not
//! there, so they compose with any pipeline kind.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::graph::{DeployableModule, GraphBackend};
use crate::pipeline::{Pipeline, SlotModule};
use crate::slots::select_parts;

/// Wraps every populated, non-ignored slot in a deployable module.
///
/// Already-wrapped slots are left as they are, so calling this twice is
/// harmless. Wrapping is per slot with no rollback: a failed `set` leaves the
/// slots wrapped so far in place.
pub fn compile_pipe(
    pipe: &mut dyn Pipeline,
    backend: &Arc<dyn GraphBackend>,
    ignores: &[&str],
) -> Result<()> {
    for slot in select_parts(ignores) {
        match pipe.take(slot) {
            None => {
                debug!(part = %slot, "slot not populated, skipping");
            }
            Some(SlotModule::Compiled(module)) => {
                debug!(part = %slot, "already compiled, skipping");
                pipe.set(slot, SlotModule::Compiled(module))?;
            }
            Some(SlotModule::Plain(module)) => {
                info!(part = %slot, backend = backend.name(), "compiling");
                let wrapped = DeployableModule::new(module, Arc::clone(backend));
                pipe.set(slot, SlotModule::Compiled(wrapped))?;
            }
        }
    }
    patch_image_processor(pipe, ignores);
    Ok(())
}

/// Writes each slot's materialized graph into `dir`.
///
/// Slots that are absent, unwrapped, or wrapped but never run are skipped.
/// With `overwrite` off, an existing artifact is left byte-for-byte as it
/// was.
pub fn save_pipe(
    pipe: &dyn Pipeline,
    dir: impl AsRef<Path>,
    ignores: &[&str],
    overwrite: bool,
) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    for slot in select_parts(ignores) {
        let Some(module) = pipe.get(slot) else {
            debug!(part = %slot, "slot not populated, skipping");
            continue;
        };
        let Some(deployable) = module.as_deployable() else {
            debug!(part = %slot, "not compiled, skipping");
            continue;
        };
        if !deployable.is_compiled() {
            debug!(part = %slot, "no materialized graph, skipping");
            continue;
        }
        let path = dir.join(slot.path());
        if !overwrite && path.is_file() {
            info!(part = %slot, "compiled graph already exists, not overwriting");
            continue;
        }
        info!(part = %slot, "saving compiled graph");
        deployable.save_graph(&path)?;
    }
    Ok(())
}

/// Loads cached graphs from `dir` into the pipeline's wrapped slots.
///
/// A missing directory is a no-op, and a slot without an artifact keeps its
/// lazy-trace behavior. Loading into a slot that was never compiled is an
/// error: the artifact belongs inside a deployable wrapper.
pub fn load_pipe(pipe: &mut dyn Pipeline, dir: impl AsRef<Path>, ignores: &[&str]) -> Result<()> {
    let dir = dir.as_ref();
    if !dir.exists() {
        debug!(dir = %dir.display(), "cache directory does not exist, nothing to load");
        return Ok(());
    }
    for slot in select_parts(ignores) {
        let Some(module) = pipe.get_mut(slot) else {
            debug!(part = %slot, "slot not populated, skipping");
            continue;
        };
        let path = dir.join(slot.path());
        if !path.is_file() {
            debug!(part = %slot, "no cached graph, skipping");
            continue;
        }
        match module {
            SlotModule::Compiled(deployable) => {
                info!(part = %slot, "loading compiled graph");
                deployable.load_graph(&path)?;
            }
            SlotModule::Plain(_) => return Err(Error::UncompiledSlot(slot)),
        }
    }
    patch_image_processor(pipe, ignores);
    Ok(())
}

fn patch_image_processor(pipe: &mut dyn Pipeline, ignores: &[&str]) {
    if ignores.contains(&"image_processor") {
        return;
    }
    match pipe.image_processor_mut() {
        Some(processor) => {
            info!("patching image processor");
            processor.patch();
        }
        None => debug!("pipeline has no image processor"),
    }
}
