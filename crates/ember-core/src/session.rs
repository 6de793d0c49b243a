use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::pool::{TaskHandle, WorkerPool};
use crate::tensor::TensorId;

// Session — the explicit context every module tree runs inside
//
// The session owns the two process-wide concerns that would otherwise
// creep into globals: the shared worker pool (argument staging,
// asynchronous optimizer steps) and the module graph.
//
// The graph is an arena: every forward call appends one execution record
// (module name, input tensor ids, output tensor id); edges are stored as
// index pairs derived from which earlier record produced each input.
// Nothing holds object references — traversal in forward order is the
// record order, the backward walk is its reverse, and tensors are
// reclaimed by ordinary Arc drop.

/// Index of one execution record in the session graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// One module application: who ran, on which tensors.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub module: String,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
}

#[derive(Default)]
struct ModuleGraph {
    steps: Vec<StepRecord>,
    /// (producer, consumer) index pairs.
    edges: Vec<(NodeId, NodeId)>,
    /// Which record produced a given tensor.
    produced: HashMap<TensorId, NodeId>,
}

struct SessionInner {
    pool: WorkerPool,
    graph: Mutex<ModuleGraph>,
    /// Per-type counters for stable module names (Linear_1, Conv2d_3, ...).
    name_counters: Mutex<HashMap<String, usize>>,
}

/// Shared handle to one training context.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session")
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Session with a machine-sized worker pool.
    pub fn new() -> Self {
        Self::with_pool(WorkerPool::with_default_size())
    }

    /// Session over an explicitly sized pool.
    pub fn with_workers(threads: usize) -> Self {
        Self::with_pool(WorkerPool::new(threads))
    }

    fn with_pool(pool: WorkerPool) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                pool,
                graph: Mutex::new(ModuleGraph::default()),
                name_counters: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The shared worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Submit a task to the session pool.
    pub fn submit<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        self.inner.pool.submit(f)
    }

    /// Hand out a unique instance name for a module of `type_name`.
    pub fn register_module(&self, type_name: &str) -> String {
        let mut counters = self
            .inner
            .name_counters
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let n = counters.entry(type_name.to_string()).or_insert(0);
        *n += 1;
        let name = format!("{type_name}_{n}");
        debug!(module = %name, "module registered");
        name
    }

    /// Append one execution record; edges to the producers of each input
    /// are derived here.
    pub fn record_step(&self, module: &str, inputs: &[TensorId], output: TensorId) -> NodeId {
        let mut graph = self.lock_graph();
        let id = NodeId(graph.steps.len());
        for input in inputs {
            if let Some(&producer) = graph.produced.get(input) {
                graph.edges.push((producer, id));
            }
        }
        graph.produced.insert(output, id);
        graph.steps.push(StepRecord {
            module: module.to_string(),
            inputs: inputs.to_vec(),
            output,
        });
        id
    }

    /// The recorded execution order (forward traversal).
    pub fn execution_order(&self) -> Vec<StepRecord> {
        self.lock_graph().steps.clone()
    }

    /// The recorded producer→consumer edges.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.lock_graph().edges.clone()
    }

    /// Which record produced `tensor`, if any.
    pub fn producer_of(&self, tensor: TensorId) -> Option<NodeId> {
        self.lock_graph().produced.get(&tensor).copied()
    }

    /// Drop all execution records, keeping module registrations. Called
    /// between training iterations by loops that re-record each pass.
    pub fn clear_graph(&self) {
        let mut graph = self.lock_graph();
        graph.steps.clear();
        graph.edges.clear();
        graph.produced.clear();
    }

    /// One-line-per-step description of the recorded graph.
    pub fn graph_summary(&self) -> String {
        let graph = self.lock_graph();
        let mut out = String::new();
        for (i, step) in graph.steps.iter().enumerate() {
            out.push_str(&format!(
                "#{i} {} inputs={:?} output={:?}\n",
                step.module, step.inputs, step.output
            ));
        }
        out
    }

    fn lock_graph(&self) -> std::sync::MutexGuard<'_, ModuleGraph> {
        self.inner.graph.lock().unwrap_or_else(|p| p.into_inner())
    }
}
