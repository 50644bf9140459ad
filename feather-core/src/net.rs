//! Host-facing network API.
//!
//! A [`Net`] moves through `Unbuilt → ParamsLoaded → WeightsLoaded → Ready`.
//! The first [`Net::forward`] after weights are bound runs setup once: shape
//! inference, fusion, topology validation, the buffer reuse plan and, on the
//! GPU backend, kernel build and argument binding. Later passes only compute.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use feather_utils::{TuningMode, timing_guard};
use log::{Level, debug, info};

use crate::blob::{BlobShape, padded_nhwc_to_nchw};
use crate::error::{LayerError, LoadError, NetError, TuningError};
use crate::gpu::KernelInfo;
use crate::graph::{BlobId, Graph, split_io};
use crate::layers::InputLayer;
use crate::mempool::{MemPool, PoolStats};
use crate::param::{ModelWeights, NetParam};
use crate::runtime::{NetConfig, Runtime};
use crate::tuner::TuningTable;

/// Lifecycle of a [`Net`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetState {
    Unbuilt,
    ParamsLoaded,
    WeightsLoaded,
    Ready,
}

/// Blobs whose last reader is each node. Empty when reuse is off.
#[derive(Debug, Default)]
struct ReusePlan {
    release_after: Vec<Vec<BlobId>>,
}

impl ReusePlan {
    fn new(graph: &Graph, reuse: bool) -> Self {
        let mut release_after = vec![Vec::new(); graph.nodes.len()];
        if !reuse {
            return Self { release_after };
        }
        let pinned: HashSet<BlobId> = graph
            .inputs()
            .iter()
            .copied()
            .chain(graph.outputs())
            .collect();
        let mut last_reader = vec![None; graph.blobs.len()];
        for (index, node) in graph.live_nodes() {
            for &bottom in &node.bottoms {
                last_reader[bottom] = Some(index);
            }
        }
        for (blob, reader) in last_reader.into_iter().enumerate() {
            if let Some(index) = reader
                && !pinned.contains(&blob)
            {
                release_after[index].push(blob);
            }
        }
        Self { release_after }
    }

    fn released_by(&self, node: usize) -> &[BlobId] {
        self.release_after.get(node).map_or(&[], Vec::as_slice)
    }
}

/// A loaded network bound to one runtime context.
#[derive(Debug)]
pub struct Net {
    runtime: Runtime,
    state: NetState,
    graph: Graph,
    pool: MemPool,
    plan: ReusePlan,
    inputs_set: HashSet<BlobId>,
    computed: bool,
}

impl Net {
    /// Create an empty net. Device selection and tuning mode are fixed here.
    pub fn new(config: NetConfig) -> Result<Self, NetError> {
        Ok(Self {
            runtime: Runtime::new(config)?,
            state: NetState::Unbuilt,
            graph: Graph::default(),
            pool: MemPool::new(),
            plan: ReusePlan::default(),
            inputs_set: HashSet::new(),
            computed: false,
        })
    }

    pub fn state(&self) -> NetState {
        self.state
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Statistics of the host buffer pool.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Number of live nodes; drops after fusion.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Live layer names in execution order.
    pub fn layer_names(&self) -> Vec<&str> {
        self.graph
            .live_nodes()
            .map(|(_, node)| node.name.as_str())
            .collect()
    }

    /// Kernels a live layer launches, with the geometry chosen at setup.
    ///
    /// Empty on the CPU backend and before the first forward; `None` for an
    /// unknown or fused-away layer.
    pub fn layer_kernels(&self, layer: &str) -> Option<&[KernelInfo]> {
        self.graph
            .live_nodes()
            .find(|(_, node)| node.name == layer)
            .map(|(_, node)| node.layer.kernels())
    }

    fn require(&self, expected: NetState) -> Result<(), NetError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NetError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn require_at_least(&self, expected: NetState) -> Result<(), NetError> {
        if self.state >= expected {
            Ok(())
        } else {
            Err(NetError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    pub fn load_param(&mut self, param: &NetParam) -> Result<(), NetError> {
        self.require(NetState::Unbuilt)?;
        self.graph = Graph::from_param(param)?;
        self.state = NetState::ParamsLoaded;
        info!(
            target: "feather::net",
            "loaded {} layers, {} inputs",
            self.graph.node_count(),
            self.graph.inputs().len()
        );
        Ok(())
    }

    pub fn load_param_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), NetError> {
        let param = NetParam::load_from_path(path)?;
        self.load_param(&param)
    }

    /// Bind weights and check them against the topology.
    ///
    /// Shapes are inferred here so that any weight that disagrees with the
    /// declared geometry is a load error rather than a forward failure.
    pub fn load_weights(&mut self, weights: &ModelWeights) -> Result<(), NetError> {
        self.require(NetState::ParamsLoaded)?;
        self.graph.bind_weights(weights)?;
        self.graph
            .infer_shapes()
            .map_err(|(layer, error)| match error {
                LayerError::Weights(reason) => LoadError::WeightMismatch { layer, reason },
                other => LoadError::Layer {
                    layer,
                    reason: other.to_string(),
                },
            })?;
        self.state = NetState::WeightsLoaded;
        debug!(target: "feather::net", "weights bound");
        Ok(())
    }

    pub fn load_weights_path<P: AsRef<Path>>(&mut self, path: P) -> Result<(), NetError> {
        let weights = ModelWeights::load_from_path(path)?;
        self.load_weights(&weights)
    }

    fn input_id(&self, name: &str) -> Result<BlobId, NetError> {
        match (self.graph.input_id(name), self.graph.blob_id(name)) {
            (Some(id), _) => Ok(id),
            (None, Some(_)) => Err(NetError::NotAnInput(name.to_string())),
            (None, None) => Err(NetError::UnknownBlob(name.to_string())),
        }
    }

    /// Copy NCHW host data into an input blob.
    pub fn set_input(&mut self, name: &str, data: &[f32]) -> Result<(), NetError> {
        self.require_at_least(NetState::WeightsLoaded)?;
        let id = self.input_id(name)?;
        let blob = self.graph.blob_mut(id);
        let expected = blob.data_size();
        if data.len() != expected {
            return Err(NetError::InputSize {
                name: name.to_string(),
                expected,
                actual: data.len(),
            });
        }
        blob.alloc(&mut self.pool, expected);
        blob.data_mut()
            .map_err(|source| NetError::Forward {
                layer: name.to_string(),
                source,
            })?
            .copy_from_slice(data);
        self.inputs_set.insert(id);
        Ok(())
    }

    /// Change the shape of an input. Setup runs again on the next forward.
    pub fn reshape_input(&mut self, name: &str, shape: BlobShape) -> Result<(), NetError> {
        self.require_at_least(NetState::WeightsLoaded)?;
        let id = self.input_id(name)?;
        let producer = self
            .graph
            .producer(id)
            .ok_or_else(|| NetError::NotAnInput(name.to_string()))?;
        let input = self.graph.nodes[producer]
            .layer
            .as_any_mut()
            .downcast_mut::<InputLayer>()
            .ok_or_else(|| NetError::NotAnInput(name.to_string()))?;
        if input.shape() == shape {
            return Ok(());
        }
        input.reshape(shape);
        self.graph.blob_mut(id).set_shape(shape);
        self.inputs_set.remove(&id);
        self.state = NetState::WeightsLoaded;
        self.computed = false;
        info!(target: "feather::net", "input '{name}' reshaped to {shape}");
        Ok(())
    }

    /// Run one forward pass, performing setup first if needed.
    pub fn forward(&mut self) -> Result<(), NetError> {
        self.require_at_least(NetState::WeightsLoaded)?;
        if let Some(&missing) = self
            .graph
            .inputs()
            .iter()
            .find(|id| !self.inputs_set.contains(*id))
        {
            let name = self
                .graph
                .input_name(missing)
                .unwrap_or_else(|| self.graph.blob(missing).name());
            return Err(NetError::InputNotSet(name.to_string()));
        }
        if self.state == NetState::WeightsLoaded {
            self.setup()?;
            self.state = NetState::Ready;
        }
        let _pass = timing_guard("forward pass", Level::Debug);
        self.execute()?;
        self.computed = true;
        Ok(())
    }

    fn setup(&mut self) -> Result<(), NetError> {
        let _setup = timing_guard("net setup", Level::Debug);
        self.graph
            .infer_shapes()
            .map_err(|(layer, source)| NetError::Setup { layer, source })?;
        if self.runtime.config().fusion {
            let fused = self.graph.fuse();
            if fused > 0 {
                info!(target: "feather::net", "fused {fused} layers");
            }
        }
        self.graph.validate_topology()?;
        self.plan = ReusePlan::new(&self.graph, self.runtime.config().reuse_buffers);
        if self.runtime.is_gpu() {
            self.setup_gpu()?;
        }
        Ok(())
    }

    /// Allocate device storage in execution order and build every kernel.
    ///
    /// A blob's device buffer returns to the pool right after the setup of its
    /// last reader, so later blobs reuse it. Bound kernels keep their own
    /// handle to the buffer.
    fn setup_gpu(&mut self) -> Result<(), NetError> {
        let Some(gpu) = self.runtime.gpu() else {
            return Ok(());
        };
        let block = gpu.channel_block_size();
        let Graph { nodes, blobs, .. } = &mut self.graph;
        for (index, node) in nodes.iter_mut().enumerate() {
            if node.removed {
                continue;
            }
            let _guard = timing_guard(format!("setup {}", node.name), Level::Trace);
            let setup_error = |source: LayerError| NetError::Setup {
                layer: node.name.clone(),
                source,
            };
            let size = blobs[node.top].shape().padded_size(block);
            blobs[node.top]
                .alloc_device(gpu, size)
                .map_err(|e| setup_error(e.into()))?;
            let (inputs, output) = split_io(blobs, &node.bottoms, node.top)
                .ok_or_else(|| setup_error(LayerError::Shape("node reads its own output".into())))?;
            node.layer
                .setup_gpu(gpu, &inputs, output)
                .map_err(setup_error)?;
            for &dead in self.plan.released_by(index) {
                blobs[dead].free();
            }
        }
        info!(
            target: "feather::gpu",
            "{} programs compiled, {} device bytes in use",
            gpu.program_count(),
            gpu.buffer_pool().memory_usage()
        );
        Ok(())
    }

    fn execute(&mut self) -> Result<(), NetError> {
        let Self {
            runtime,
            graph,
            pool,
            plan,
            ..
        } = self;
        let Graph { nodes, blobs, .. } = graph;
        for (index, node) in nodes.iter_mut().enumerate() {
            if node.removed {
                continue;
            }
            let _guard = timing_guard(format!("forward {}", node.name), Level::Trace);
            let forward_error = |source: LayerError| NetError::Forward {
                layer: node.name.clone(),
                source,
            };
            match runtime.gpu() {
                Some(gpu) => {
                    let (inputs, output) = split_io(blobs, &node.bottoms, node.top)
                        .ok_or_else(|| forward_error(LayerError::Shape("bad wiring".into())))?;
                    node.layer
                        .forward_gpu(gpu, &node.name, &inputs, output)
                        .map_err(forward_error)?;
                }
                None => {
                    let size = blobs[node.top].data_size();
                    blobs[node.top].alloc(pool, size);
                    let (inputs, output) = split_io(blobs, &node.bottoms, node.top)
                        .ok_or_else(|| forward_error(LayerError::Shape("bad wiring".into())))?;
                    node.layer
                        .forward_cpu(runtime.cpu(), &inputs, output)
                        .map_err(forward_error)?;
                    for &dead in plan.released_by(index) {
                        blobs[dead].release_host(pool);
                    }
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<BlobId, NetError> {
        self.graph
            .blob_id(name)
            .ok_or_else(|| NetError::UnknownBlob(name.to_string()))
    }

    /// Logical element count of a blob.
    pub fn get_blob_data_size(&self, name: &str) -> Result<usize, NetError> {
        let id = self.lookup(name)?;
        Ok(self.graph.blob(id).data_size())
    }

    /// Shape of a blob as of the last shape inference.
    pub fn blob_shape(&self, name: &str) -> Result<BlobShape, NetError> {
        let id = self.lookup(name)?;
        Ok(self.graph.blob(id).shape())
    }

    /// Current contents of a blob in NCHW order.
    ///
    /// On the GPU backend this waits for queued work and reads the device
    /// buffer back.
    pub fn extract_blob(&self, name: &str) -> Result<Vec<f32>, NetError> {
        let id = self.lookup(name)?;
        let blob = self.graph.blob(id);
        if blob.is_released() {
            return Err(NetError::BlobReleased(name.to_string()));
        }
        if !self.computed {
            return Err(NetError::NotComputed(name.to_string()));
        }
        match self.runtime.gpu() {
            Some(gpu) => {
                let device = blob
                    .device_buffer()
                    .map_err(|_| NetError::NotComputed(name.to_string()))?;
                let block = gpu.channel_block_size();
                let shape = blob.shape();
                gpu.finish()?;
                let padded = gpu.read_buffer(device, shape.padded_size(block))?;
                Ok(padded_nhwc_to_nchw(&padded, shape, block))
            }
            None => blob
                .data()
                .map(|data| data[..blob.data_size()].to_vec())
                .map_err(|_| NetError::NotComputed(name.to_string())),
        }
    }

    /// Diagnostic dump of a blob, one line per channel.
    pub fn format_blob_data(&self, name: &str) -> Result<String, NetError> {
        let data = self.extract_blob(name)?;
        let shape = self.blob_shape(name)?;
        let plane = (shape.height * shape.width).max(1);
        let mut out = format!("{name} {shape}\n");
        for (index, values) in data.chunks(plane).enumerate() {
            let (n, c) = (index / shape.channels.max(1), index % shape.channels.max(1));
            out.push_str(&format!("[{n},{c}]"));
            for value in values {
                out.push_str(&format!(" {value:.6}"));
            }
            out.push('\n');
        }
        Ok(out)
    }

    pub fn print_blob_data(&self, name: &str) -> Result<(), NetError> {
        print!("{}", self.format_blob_data(name)?);
        Ok(())
    }

    /// Copy of the tuning table, `None` on the CPU backend.
    pub fn tuning_table(&self) -> Option<TuningTable> {
        self.runtime.gpu().map(|gpu| gpu.tuner().table().clone())
    }

    /// Persist the tuning table gathered by a Tuning or TunerInProcess session.
    ///
    /// Writes to `path`, or to the configured table path when `None`.
    pub fn save_tuning_table(&self, path: Option<&Path>) -> Result<PathBuf, NetError> {
        let settings = &self.runtime.config().tuning;
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| settings.table_path.clone())
            .ok_or(TuningError::NoTablePath)?;
        let Some(gpu) = self.runtime.gpu() else {
            return Err(NetError::Gpu(crate::error::GpuError::Unavailable(
                "tuning tables exist only on the GPU backend".into(),
            )));
        };
        let tuner = gpu.tuner();
        if !tuner.mode().records() {
            debug!(
                target: "feather::tuner",
                "saving a table in {} mode; it holds only loaded entries",
                tuner.mode()
            );
        }
        tuner.table().save_to_path(&path)?;
        info!(
            target: "feather::tuner",
            "saved {} tuning entries to {}",
            tuner.table().len(),
            path.display()
        );
        Ok(path)
    }

    /// Tuning mode of the runtime, `Disabled` on the CPU backend.
    pub fn tuning_mode(&self) -> TuningMode {
        self.runtime
            .gpu()
            .map_or(TuningMode::Disabled, |gpu| gpu.tuner().mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{LayerParam, OpParam, WeightBlob};

    fn relu_param() -> NetParam {
        NetParam::new(vec![
            LayerParam::new(
                "data",
                &[],
                "data",
                OpParam::Input {
                    num: 1,
                    channels: 3,
                    height: 1,
                    width: 1,
                },
            ),
            LayerParam::new(
                "act",
                &["data"],
                "act",
                OpParam::Relu {
                    negative_slope: 0.0,
                },
            ),
        ])
    }

    fn loaded() -> Net {
        let mut net = Net::new(NetConfig::cpu().with_num_threads(2)).expect("net");
        net.load_param(&relu_param()).expect("param");
        net.load_weights(&ModelWeights::new()).expect("weights");
        net
    }

    #[test]
    fn operations_check_the_lifecycle() {
        let mut net = Net::new(NetConfig::cpu()).expect("net");
        assert_eq!(net.state(), NetState::Unbuilt);
        assert!(matches!(
            net.load_weights(&ModelWeights::new()),
            Err(NetError::InvalidState {
                expected: NetState::ParamsLoaded,
                actual: NetState::Unbuilt
            })
        ));
        net.load_param(&relu_param()).expect("param");
        assert!(matches!(
            net.forward(),
            Err(NetError::InvalidState {
                actual: NetState::ParamsLoaded,
                ..
            })
        ));
        assert!(matches!(
            net.load_param(&relu_param()),
            Err(NetError::InvalidState { .. })
        ));
    }

    #[test]
    fn input_contract_is_enforced() {
        let mut net = loaded();
        assert!(matches!(net.forward(), Err(NetError::InputNotSet(name)) if name == "data"));
        assert!(matches!(
            net.set_input("data", &[1.0, 2.0]),
            Err(NetError::InputSize {
                expected: 3,
                actual: 2,
                ..
            })
        ));
        assert!(matches!(
            net.set_input("act", &[1.0, 2.0, 3.0]),
            Err(NetError::NotAnInput(_))
        ));
        assert!(matches!(
            net.set_input("nope", &[]),
            Err(NetError::UnknownBlob(_))
        ));
    }

    #[test]
    fn extraction_needs_a_forward_pass() {
        let mut net = loaded();
        net.set_input("data", &[-1.0, 0.5, 2.0]).expect("input");
        assert!(matches!(net.extract_blob("act"), Err(NetError::NotComputed(_))));
        net.forward().expect("forward");
        assert_eq!(net.state(), NetState::Ready);
        assert_eq!(net.extract_blob("act").expect("act"), vec![0.0, 0.5, 2.0]);
        assert_eq!(net.get_blob_data_size("act").expect("size"), 3);
        let dump = net.format_blob_data("act").expect("dump");
        assert!(dump.starts_with("act "));
        assert_eq!(dump.lines().count(), 4);
    }

    #[test]
    fn reshaping_an_input_returns_to_weights_loaded() {
        let mut net = loaded();
        net.set_input("data", &[1.0, 2.0, 3.0]).expect("input");
        net.forward().expect("forward");
        net.reshape_input("data", BlobShape::new(1, 3, 2, 1))
            .expect("reshape");
        assert_eq!(net.state(), NetState::WeightsLoaded);
        assert!(matches!(net.forward(), Err(NetError::InputNotSet(_))));
        net.set_input("data", &[1.0, -2.0, 3.0, -4.0, 5.0, -6.0])
            .expect("input");
        net.forward().expect("forward");
        assert_eq!(
            net.extract_blob("act").expect("act"),
            vec![1.0, 0.0, 3.0, 0.0, 5.0, 0.0]
        );
    }

    #[test]
    fn reuse_plan_spares_inputs_and_outputs() {
        let param = NetParam::new(vec![
            LayerParam::new(
                "data",
                &[],
                "data",
                OpParam::Input {
                    num: 1,
                    channels: 2,
                    height: 1,
                    width: 1,
                },
            ),
            LayerParam::new("scale", &["data"], "scaled", OpParam::Scale { bias_term: false }),
            LayerParam::new(
                "act",
                &["scaled"],
                "act",
                OpParam::Relu {
                    negative_slope: 0.1,
                },
            ),
        ]);
        let mut weights = ModelWeights::new();
        weights.push(1, WeightBlob::vector(vec![2.0, -1.0]));
        let mut graph = Graph::from_param(&param).expect("graph");
        graph.bind_weights(&weights).expect("weights");
        let plan = ReusePlan::new(&graph, true);
        let scaled = graph.blob_id("scaled").expect("scaled");
        assert_eq!(plan.released_by(2), &[scaled]);
        assert!(plan.released_by(1).is_empty());
        assert!(ReusePlan::new(&graph, false).released_by(2).is_empty());
    }
}
