//! Error taxonomy for loading, building and running networks.
//!
//! Every category is fatal for the operation that raised it. Load errors abort
//! construction, setup errors abort the net, and forward errors abort the
//! current pass while naming the offending layer.

use std::path::PathBuf;

use feather_utils::BufferPoolError;
use thiserror::Error;

use crate::net::NetState;

/// Failures while reading or binding a parsed model.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed model: {0}")]
    Malformed(String),
    #[error("bad magic number {found} (expected {expected})")]
    BadMagic { found: u32, expected: u32 },
    #[error("duplicate layer name '{0}'")]
    DuplicateLayer(String),
    #[error("layer '{layer}' reads blob '{blob}' that no earlier layer produces")]
    UnknownBottom { layer: String, blob: String },
    #[error("layer '{layer}': {reason}")]
    Layer { layer: String, reason: String },
    #[error("weight mismatch in layer '{layer}': {reason}")]
    WeightMismatch { layer: String, reason: String },
}

/// Failures reported by the GPU kernel runtime.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU backend unavailable: {0}")]
    Unavailable(String),
    #[error("failed to compile program '{program}' with options [{options}]:\n{log}")]
    Compile {
        program: String,
        options: String,
        log: String,
    },
    #[error("no kernel source named '{0}'")]
    UnknownProgram(String),
    #[error("kernel '{kernel}' rejected argument {index}: {reason}")]
    ArgBinding {
        kernel: String,
        index: usize,
        reason: String,
    },
    #[error("launch of kernel '{kernel}' failed: {reason}")]
    Launch { kernel: String, reason: String },
    #[error("device synchronization failed: {0}")]
    Sync(String),
    #[error("device readback failed: {0}")]
    Readback(String),
    #[error(transparent)]
    BufferPool(#[from] BufferPoolError),
    #[error("kernel '{0}' was launched before it was built")]
    KernelNotBuilt(String),
    #[error("memory type '{0}' is not supported by the GPU runtime")]
    UnsupportedMemoryType(String),
}

/// Failures of the autotuner and its persisted table.
#[derive(Debug, Error)]
pub enum TuningError {
    #[error("tuning table has no entry '{key}'")]
    LookupMiss { key: String },
    #[error("tuning table entry '{key}' records {found:?} but the graph needs {expected:?}")]
    StaleEntry {
        key: String,
        expected: [u32; 3],
        found: [u32; 3],
    },
    #[error("failed to access tuning table {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse tuning table {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no launch geometry candidates for kernel '{kernel}'")]
    NoCandidates { kernel: String },
    #[error("no tuning table path configured")]
    NoTablePath,
}

/// Failures raised by a single operator.
#[derive(Debug, Error)]
pub enum LayerError {
    #[error("shape error: {0}")]
    Shape(String),
    #[error("weights do not fit the input: {0}")]
    Weights(String),
    #[error("blob '{0}' has no storage allocated")]
    Unallocated(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Tuning(#[from] TuningError),
}

/// Errors surfaced through the [`crate::Net`] host API.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("net is {actual:?} but the operation requires {expected:?}")]
    InvalidState { expected: NetState, actual: NetState },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("setup of layer '{layer}' failed: {source}")]
    Setup {
        layer: String,
        #[source]
        source: LayerError,
    },
    #[error("forward of layer '{layer}' failed: {source}")]
    Forward {
        layer: String,
        #[source]
        source: LayerError,
    },
    #[error("unknown blob '{0}'")]
    UnknownBlob(String),
    #[error("blob '{0}' is not a network input")]
    NotAnInput(String),
    #[error("input '{name}' expects {expected} values, got {actual}")]
    InputSize {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("input '{0}' has not been set")]
    InputNotSet(String),
    #[error("blob '{0}' was released for reuse after its last reader")]
    BlobReleased(String),
    #[error("blob '{0}' has not been computed yet")]
    NotComputed(String),
    #[error("failed to build CPU worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error(transparent)]
    Tuning(#[from] TuningError),
}
