//! Graph backends and the deployable wrapper around compilable modules.
//!
//! A backend turns a module into an opaque execution graph. The wrapper owns
//! both and materializes the graph lazily, on the first forward call, so
//! wrapping a whole pipeline stays cheap until a module is actually run.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::module::PipelineModule;

/// A compiled execution plan for one module.
///
/// `run` receives the module it was traced from; real backends replay their
/// lowered graph and ignore it, the eager reference backend calls back into
/// the module.
pub trait ExecutionGraph: Send {
    fn run(&mut self, module: &mut dyn PipelineModule, inputs: &[Tensor]) -> Result<Tensor>;

    fn serialize(&self) -> Result<Vec<u8>>;
}

/// A compiler strategy: how modules are traced into graphs and how saved
/// graphs are brought back.
pub trait GraphBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn trace(
        &self,
        module: &mut dyn PipelineModule,
        inputs: &[Tensor],
    ) -> Result<Box<dyn ExecutionGraph>>;

    fn deserialize(
        &self,
        bytes: &[u8],
        module: &mut dyn PipelineModule,
    ) -> Result<Box<dyn ExecutionGraph>>;
}

/// A module bound to a graph backend.
pub struct DeployableModule {
    module: Box<dyn PipelineModule>,
    backend: Arc<dyn GraphBackend>,
    graph: Option<Box<dyn ExecutionGraph>>,
}

impl DeployableModule {
    pub fn new(module: Box<dyn PipelineModule>, backend: Arc<dyn GraphBackend>) -> Self {
        Self {
            module,
            backend,
            graph: None,
        }
    }

    /// Runs the module through its graph, tracing it first if no graph has
    /// been materialized yet.
    pub fn forward(&mut self, inputs: &[Tensor]) -> Result<Tensor> {
        if self.graph.is_none() {
            debug!(backend = self.backend.name(), "tracing module on first call");
            let graph = self.backend.trace(self.module.as_mut(), inputs)?;
            self.graph = Some(graph);
        }
        let Self { module, graph, .. } = self;
        let graph = graph
            .as_mut()
            .ok_or_else(|| Error::Backend("no execution graph after trace".into()))?;
        graph.run(module.as_mut(), inputs)
    }

    /// Whether a graph has been materialized, by tracing or by loading.
    pub fn is_compiled(&self) -> bool {
        self.graph.is_some()
    }

    /// Writes the serialized graph to `path`. The write goes straight to the
    /// target file, so an existing artifact is only touched once this starts.
    pub fn save_graph(&self, path: impl AsRef<Path>) -> Result<()> {
        let graph = self.graph.as_ref().ok_or(Error::NoCompiledGraph)?;
        let bytes = graph.serialize()?;
        fs::write(path, bytes)?;
        Ok(())
    }

    /// Replaces the current graph with one deserialized from `path`,
    /// skipping the trace that would otherwise happen on first forward.
    pub fn load_graph(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = fs::read(path)?;
        let graph = self.backend.deserialize(&bytes, self.module.as_mut())?;
        self.graph = Some(graph);
        Ok(())
    }

    pub fn module(&self) -> &dyn PipelineModule {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> &mut dyn PipelineModule {
        self.module.as_mut()
    }
}

const GRAPH_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct GraphSignature {
    backend: String,
    version: u32,
    input_shapes: Vec<Vec<usize>>,
    input_dtypes: Vec<String>,
}

impl GraphSignature {
    fn of(backend: &str, inputs: &[Tensor]) -> Self {
        Self {
            backend: backend.to_string(),
            version: GRAPH_FORMAT_VERSION,
            input_shapes: inputs.iter().map(|t| t.dims().to_vec()).collect(),
            input_dtypes: inputs.iter().map(|t| format!("{:?}", t.dtype())).collect(),
        }
    }

    fn check_inputs(&self, inputs: &[Tensor]) -> Result<()> {
        let shapes: Vec<Vec<usize>> = inputs.iter().map(|t| t.dims().to_vec()).collect();
        let dtypes: Vec<String> = inputs.iter().map(|t| format!("{:?}", t.dtype())).collect();
        if shapes != self.input_shapes || dtypes != self.input_dtypes {
            return Err(Error::Backend(format!(
                "input signature mismatch: traced {:?} {:?}, got {:?} {:?}",
                self.input_shapes, self.input_dtypes, shapes, dtypes
            )));
        }
        Ok(())
    }
}

/// The reference backend: the "graph" records the traced input signature and
/// replays the module eagerly. It exists to exercise the compile, save and
/// load paths without a real compiler behind them.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerBackend;

impl EagerBackend {
    pub fn new() -> Self {
        Self
    }
}

impl GraphBackend for EagerBackend {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn trace(
        &self,
        module: &mut dyn PipelineModule,
        inputs: &[Tensor],
    ) -> Result<Box<dyn ExecutionGraph>> {
        // Run the module once so tracing fails where a real lowering would.
        module.forward(inputs)?;
        Ok(Box::new(EagerGraph {
            signature: GraphSignature::of(self.name(), inputs),
        }))
    }

    fn deserialize(
        &self,
        bytes: &[u8],
        _module: &mut dyn PipelineModule,
    ) -> Result<Box<dyn ExecutionGraph>> {
        let signature: GraphSignature =
            serde_json::from_slice(bytes).map_err(|e| Error::Backend(e.to_string()))?;
        if signature.backend != self.name() || signature.version != GRAPH_FORMAT_VERSION {
            return Err(Error::Backend(format!(
                "artifact was produced by `{}` format v{}, expected `{}` v{}",
                signature.backend,
                signature.version,
                self.name(),
                GRAPH_FORMAT_VERSION
            )));
        }
        Ok(Box::new(EagerGraph { signature }))
    }
}

struct EagerGraph {
    signature: GraphSignature,
}

impl ExecutionGraph for EagerGraph {
    fn run(&mut self, module: &mut dyn PipelineModule, inputs: &[Tensor]) -> Result<Tensor> {
        self.signature.check_inputs(inputs)?;
        module.forward(inputs)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.signature).map_err(|e| Error::Backend(e.to_string()))
    }
}
