//! Loading LoRA weights into a pipeline's unet by fusing them in place.
//!
//! The loader takes a raw state dict, routes and groups its keys by target
//! layer, maps network alphas onto the groups, and hands each group to a
//! [`WeightFuser`]. Fusion mutates the base weights directly, so the module
//! runs at full speed afterwards and a compiled wrapper around it keeps
//! working; `unfuse_lora` puts the stashed originals back.

pub mod fuse;
pub mod state_dict;

pub use fuse::{DeltaFuser, FuseOptions, FuseParams, WeightFuser};
pub use state_dict::read_state_dict;

use std::collections::{BTreeMap, HashMap, HashSet};

use candle_core::Tensor;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::layers::LayerMut;
use crate::lora::fuse::LORA_DOWN_KEY;
use crate::offload::{remove_offload_hooks, restore_offload};
use crate::pipeline::{Pipeline, SlotModule};

/// Raw LoRA weights keyed by their dotted state-dict names.
pub type LoraStateDict = HashMap<String, Tensor>;

/// Scalar alphas keyed by their full `.alpha` names.
pub type NetworkAlphas = HashMap<String, f64>;

const UNET_PREFIX: &str = "unet.";
const TEXT_ENCODER_PREFIX: &str = "text_encoder.";
const ALPHA_SUFFIX: &str = ".alpha";

/// The adapters fused into a module, by name, with their active scale.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, f64>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Registers an adapter at the default active scale of 1.0.
    pub fn register(&mut self, name: &str) {
        self.adapters.insert(name.to_string(), 1.0);
    }

    pub fn scale(&self, name: &str) -> Option<f64> {
        self.adapters.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn clear(&mut self) {
        self.adapters.clear();
    }

    /// First free `default_<n>` name.
    pub fn next_default_name(&self) -> String {
        let mut n = 0;
        loop {
            let name = format!("default_{n}");
            if !self.contains(&name) {
                return name;
            }
            n += 1;
        }
    }
}

/// The fusion surface of a module: mutable access to its named layers plus
/// the adapter registry bookkeeping fused adapters.
pub trait LoraTarget {
    fn layer_mut(&mut self, path: &str) -> Option<LayerMut<'_>>;

    fn for_each_layer_mut(&mut self, f: &mut dyn FnMut(&str, LayerMut<'_>));

    fn adapters(&self) -> &AdapterRegistry;

    fn adapters_mut(&mut self) -> &mut AdapterRegistry;
}

/// Fuses a LoRA state dict into the unet module.
///
/// The state dict may scope its keys with `unet.` / `text_encoder.` prefixes,
/// in which case only the unet subset is used, or use the legacy unprefixed
/// format, which is assumed to target the unet wholesale. Keys are grouped by
/// target layer (the last three dot-segments are the in-group sub-key) and
/// fused in sorted order.
///
/// `pipeline` is only needed for offload bookkeeping: when given, offload
/// hooks are removed from its components before the weights are touched and
/// the offload mode is re-enabled afterwards.
///
/// Fusion is not transactional. The adapter name is registered before
/// validation, and groups fused before a failing one stay fused.
pub fn load_lora_into_unet(
    state_dict: LoraStateDict,
    network_alphas: Option<NetworkAlphas>,
    unet: &mut SlotModule,
    adapter_name: Option<&str>,
    fuser: &dyn WeightFuser,
    options: &FuseOptions,
    mut pipeline: Option<&mut dyn Pipeline>,
) -> Result<()> {
    let target = lora_target_of(unet)?;

    // Adapter bookkeeping comes first; a duplicate name must fail before any
    // grouping or fusion work happens.
    let adapter_name = match adapter_name {
        Some(name) => name.to_string(),
        None => target.adapters().next_default_name(),
    };
    if target.adapters().contains(&adapter_name) {
        return Err(Error::DuplicateAdapter(adapter_name));
    }
    target.adapters_mut().register(&adapter_name);

    let (state_dict, network_alphas) = route_to_unet(state_dict, network_alphas);

    let is_lora = state_dict
        .keys()
        .all(|key| key.contains("lora") || key.ends_with(ALPHA_SUFFIX));
    if !is_lora {
        return Err(Error::NotLoraFormat);
    }

    // Group keys by target layer, in sorted order so group contents and the
    // fusion sequence are deterministic.
    let mut groups: BTreeMap<String, HashMap<String, Tensor>> = BTreeMap::new();
    let mut mapped_alphas: HashMap<String, f64> = HashMap::new();
    let mut unassigned: Vec<String> = Vec::new();
    let mut consumed_alphas: HashSet<String> = HashSet::new();

    let mut alpha_keys: Vec<String> = network_alphas
        .as_ref()
        .map(|alphas| alphas.keys().cloned().collect())
        .unwrap_or_default();
    alpha_keys.sort();

    let mut entries: Vec<(String, Tensor)> = state_dict.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    for (key, value) in entries {
        let Some((module_path, sub_key)) = split_module_key(&key) else {
            unassigned.push(key);
            continue;
        };
        if let Some(alphas) = &network_alphas {
            for alpha_key in &alpha_keys {
                let stem = alpha_key.strip_suffix(ALPHA_SUFFIX).unwrap_or(alpha_key);
                if key.contains(stem) {
                    if let Some(alpha) = alphas.get(alpha_key) {
                        mapped_alphas.insert(module_path.to_string(), *alpha);
                    }
                    consumed_alphas.insert(alpha_key.clone());
                }
            }
        }
        groups
            .entry(module_path.to_string())
            .or_default()
            .insert(sub_key.to_string(), value);
    }

    if network_alphas.is_some() {
        let leftover: Vec<String> = alpha_keys
            .iter()
            .filter(|key| !consumed_alphas.contains(*key))
            .cloned()
            .collect();
        if !leftover.is_empty() {
            return Err(Error::UnconsumedNetworkAlphas(leftover));
        }
    }
    if !unassigned.is_empty() {
        return Err(Error::UnassignedLoraKeys(unassigned));
    }

    // Offload hooks would swap weights around under the fuse; strip them now
    // and put the offload mode back once the mutation is done.
    let prior_hook = pipeline
        .as_mut()
        .and_then(|pipe| remove_offload_hooks(&mut **pipe));

    info!(
        adapter = %adapter_name,
        groups = groups.len(),
        "fusing LoRA weights into unet"
    );
    for (path, group) in &groups {
        let down = group
            .get(LORA_DOWN_KEY)
            .ok_or_else(|| Error::IncompleteLoraGroup {
                path: path.clone(),
                key: LORA_DOWN_KEY,
            })?;
        let rank = down.dim(0)?;
        let params = FuseParams {
            path,
            group,
            lora_scale: options.lora_scale,
            alpha: mapped_alphas.get(path).copied(),
            rank,
            offload_device: &options.offload_device,
            adapter_name: &adapter_name,
            use_cache: options.use_cache,
        };
        match target.layer_mut(path) {
            None => return Err(Error::ModuleNotFound(path.clone())),
            Some(LayerMut::Linear(layer)) | Some(LayerMut::AdapterLinear(layer)) => {
                fuser.fuse_linear(layer, &params)?
            }
            Some(LayerMut::Conv2d(layer)) | Some(LayerMut::AdapterConv2d(layer)) => {
                fuser.fuse_conv2d(layer, &params)?
            }
            Some(LayerMut::Unsupported { kind }) => {
                return Err(Error::UnsupportedModuleType {
                    path: path.clone(),
                    kind,
                })
            }
        }
        debug!(target = %path, rank, "fused LoRA group");
    }

    if let Some(pipe) = pipeline {
        restore_offload(pipe, prior_hook);
    }
    Ok(())
}

/// Restores every stashed original weight and clears the adapter registry.
/// Returns how many layers were restored.
pub fn unfuse_lora(unet: &mut SlotModule) -> Result<usize> {
    let target = lora_target_of(unet)?;
    let mut restored = 0usize;
    let mut failure: Option<Error> = None;
    target.for_each_layer_mut(&mut |_, layer| {
        if failure.is_some() {
            return;
        }
        let result = match layer {
            LayerMut::Linear(layer) | LayerMut::AdapterLinear(layer) => layer.restore_weight(),
            LayerMut::Conv2d(layer) | LayerMut::AdapterConv2d(layer) => layer.restore_weight(),
            LayerMut::Unsupported { .. } => Ok(false),
        };
        match result {
            Ok(true) => restored += 1,
            Ok(false) => {}
            Err(err) => failure = Some(err),
        }
    });
    if let Some(err) = failure {
        return Err(err);
    }
    target.adapters_mut().clear();
    info!(layers = restored, "unfused LoRA weights");
    Ok(restored)
}

fn lora_target_of(unet: &mut SlotModule) -> Result<&mut dyn LoraTarget> {
    unet.module_mut()
        .as_lora_target()
        .ok_or(Error::NotLoraCapable)
}

/// Narrows a state dict to the unet when its keys are component-scoped, and
/// strips the scope prefix. Unscoped dicts are the legacy format and are
/// assumed to target the unet as a whole.
fn route_to_unet(
    state_dict: LoraStateDict,
    network_alphas: Option<NetworkAlphas>,
) -> (LoraStateDict, Option<NetworkAlphas>) {
    let scoped = state_dict
        .keys()
        .all(|key| key.starts_with(UNET_PREFIX) || key.starts_with(TEXT_ENCODER_PREFIX));
    if !scoped {
        warn!(
            "LoRA state dict uses the legacy unscoped format, assuming every key targets the unet"
        );
        return (state_dict, network_alphas);
    }

    info!("loading the unet-scoped subset of the LoRA state dict");
    let state_dict = state_dict
        .into_iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(UNET_PREFIX)
                .map(|rest| (rest.to_string(), value))
        })
        .collect();
    let network_alphas = network_alphas.map(|alphas| {
        alphas
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(UNET_PREFIX)
                    .map(|rest| (rest.to_string(), value))
            })
            .collect()
    });
    (state_dict, network_alphas)
}

/// Splits a state-dict key into its target layer path and the sub-key formed
/// by the last three dot-segments. Keys too short to have both parts do not
/// split.
fn split_module_key(key: &str) -> Option<(&str, &str)> {
    let mut idx = key.len();
    for _ in 0..3 {
        idx = key[..idx].rfind('.')?;
    }
    Some((&key[..idx], &key[idx + 1..]))
}
