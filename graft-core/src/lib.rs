//! Graph compilation, graph caching and LoRA weight fusion for diffusion
//! pipeline submodules.
//!
//! The core loop is: [`compile_pipe`] wraps each populated pipeline slot in a
//! [`DeployableModule`] bound to a [`GraphBackend`]; running a wrapped module
//! materializes its execution graph; [`save_pipe`] and [`load_pipe`] move the
//! materialized graphs through an on-disk cache so later runs skip the
//! compilation cost. [`load_lora_into_unet`] fuses LoRA weights into the
//! wrapped module's base weights so adapters compose with compilation.

pub mod compile;
pub mod error;
pub mod graph;
pub mod layers;
pub mod lora;
pub mod module;
pub mod offload;
pub mod pipeline;
pub mod slots;

pub use compile::*;
pub use error::*;
pub use graph::*;
pub use layers::*;
pub use lora::*;
pub use module::*;
pub use offload::*;
pub use pipeline::*;
pub use slots::*;
