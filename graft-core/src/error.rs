use crate::slots::Slot;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("pipeline does not expose slot `{0}`")]
    MissingSlot(Slot),

    #[error("slot `{0}` holds an uncompiled module, compile the pipeline before loading graphs")]
    UncompiledSlot(Slot),

    #[error("deployable module has no materialized graph to save")]
    NoCompiledGraph,

    #[error("adapter `{0}` is already registered on the target module")]
    DuplicateAdapter(String),

    #[error("state dict does not look like LoRA weights")]
    NotLoraFormat,

    #[error("LoRA keys could not be assigned to a module: {}", .0.join(", "))]
    UnassignedLoraKeys(Vec<String>),

    #[error("network alphas left unconsumed after mapping: {}", .0.join(", "))]
    UnconsumedNetworkAlphas(Vec<String>),

    #[error("LoRA group for `{path}` is missing `{key}`")]
    IncompleteLoraGroup { path: String, key: &'static str },

    #[error("no module found at `{0}`")]
    ModuleNotFound(String),

    #[error("module at `{path}` cannot be fused, got {kind}")]
    UnsupportedModuleType { path: String, kind: &'static str },

    #[error("module does not expose LoRA-fusable layers")]
    NotLoraCapable,

    #[error("graph backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
