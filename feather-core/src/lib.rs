//! CNN inference engine with CPU and GPU backends.
//!
//! A [`Net`] is built from parsed layer records ([`NetParam`]) and weight
//! buffers ([`ModelWeights`]), then run forward on a rayon worker pool or on
//! WGSL compute kernels through `wgpu`, with per-kernel launch geometry chosen
//! by the [`Tuner`].

/// Tensor storage and layout conversion.
pub mod blob;
/// Error taxonomy.
pub mod error;
/// GPU kernel runtime: program cache, kernel metadata, launches.
pub mod gpu;
/// Node and blob arena with fusion.
pub mod graph;
/// Operators.
pub mod layers;
/// Host buffer pool.
pub mod mempool;
/// Host-facing network API.
pub mod net;
/// Parsed model records and the weight container.
pub mod param;
/// Runtime context and configuration.
pub mod runtime;
/// Launch geometry search and the persisted tuning table.
pub mod tuner;

pub use blob::{Blob, BlobShape, channels_padding};
pub use error::{GpuError, LayerError, LoadError, NetError, TuningError};
pub use gpu::GpuRuntime;
pub use graph::Graph;
pub use mempool::{MemPool, PoolStats};
pub use net::{Net, NetState};
pub use param::{
    EltwiseOp, LayerParam, ModelWeights, NetParam, OpParam, PARAM_MAGIC, PoolMethod, WeightBlob,
};
pub use runtime::{CpuContext, NetConfig, Runtime};
pub use tuner::{Geometry, GeometryKind, Tuner, TuningEntry, TuningTable, tuning_key};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
