//! Parsed model records consumed by [`crate::Net`].
//!
//! Topology arrives as a [`NetParam`] (JSON on disk) and weights as
//! [`ModelWeights`] (a little-endian binary container on disk, or built in
//! code). Weight records are keyed by the index of the layer in the parameter
//! list, before any renaming or fusion.

use std::{
    collections::BTreeMap,
    fs,
    io::{Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::error::LoadError;

/// Header value every parameter stream must carry.
pub const PARAM_MAGIC: u32 = 7767517;

const WEIGHTS_MAGIC: &[u8; 4] = b"FTHW";
const WEIGHTS_VERSION: u32 = 1;

/// Whole-network topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetParam {
    pub magic: u32,
    pub layers: Vec<LayerParam>,
}

impl NetParam {
    pub fn new(layers: Vec<LayerParam>) -> Self {
        Self {
            magic: PARAM_MAGIC,
            layers,
        }
    }

    /// Parse and validate a JSON parameter stream.
    pub fn from_json_str(json: &str) -> Result<Self, LoadError> {
        let param: NetParam =
            serde_json::from_str(json).map_err(|e| LoadError::Malformed(e.to_string()))?;
        param.validate()?;
        Ok(param)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String, LoadError> {
        serde_json::to_string_pretty(self).map_err(|e| LoadError::Malformed(e.to_string()))
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), LoadError> {
        let path = path.as_ref();
        fs::write(path, self.to_json_string()?).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reject headers and records that cannot describe a network.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.magic != PARAM_MAGIC {
            return Err(LoadError::BadMagic {
                found: self.magic,
                expected: PARAM_MAGIC,
            });
        }
        if self.layers.is_empty() {
            return Err(LoadError::Malformed("parameter stream has no layers".into()));
        }
        for layer in &self.layers {
            if layer.name.is_empty() {
                return Err(LoadError::Malformed("layer with an empty name".into()));
            }
            if layer.top.len() != 1 {
                return Err(LoadError::Layer {
                    layer: layer.name.clone(),
                    reason: format!("expected exactly one top blob, got {}", layer.top.len()),
                });
            }
        }
        Ok(())
    }
}

/// One layer record: identity, wiring and operator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParam {
    pub name: String,
    #[serde(default)]
    pub bottom: Vec<String>,
    #[serde(default)]
    pub top: Vec<String>,
    #[serde(flatten)]
    pub op: OpParam,
}

impl LayerParam {
    pub fn new(name: impl Into<String>, bottom: &[&str], top: &str, op: OpParam) -> Self {
        Self {
            name: name.into(),
            bottom: bottom.iter().map(|b| b.to_string()).collect(),
            top: vec![top.to_string()],
            op,
        }
    }
}

/// Operator type tag plus its scalar parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OpParam {
    Input {
        #[serde(default = "one")]
        num: usize,
        channels: usize,
        height: usize,
        width: usize,
    },
    #[serde(rename = "ReLU")]
    Relu {
        #[serde(default)]
        negative_slope: f32,
    },
    Softmax {},
    InnerProduct {
        num_output: usize,
        #[serde(default = "yes")]
        bias_term: bool,
    },
    Convolution {
        num_output: usize,
        kernel_h: usize,
        kernel_w: usize,
        #[serde(default = "one")]
        stride_h: usize,
        #[serde(default = "one")]
        stride_w: usize,
        #[serde(default)]
        pad_h: usize,
        #[serde(default)]
        pad_w: usize,
        #[serde(default = "one")]
        dilation_h: usize,
        #[serde(default = "one")]
        dilation_w: usize,
        #[serde(default = "one")]
        group: usize,
        #[serde(default = "yes")]
        bias_term: bool,
    },
    Pooling {
        #[serde(default)]
        method: PoolMethod,
        #[serde(default)]
        kernel_h: usize,
        #[serde(default)]
        kernel_w: usize,
        #[serde(default = "one")]
        stride_h: usize,
        #[serde(default = "one")]
        stride_w: usize,
        #[serde(default)]
        pad_h: usize,
        #[serde(default)]
        pad_w: usize,
        #[serde(default)]
        global: bool,
    },
    Scale {
        #[serde(default)]
        bias_term: bool,
    },
    BatchNorm {
        #[serde(default = "default_eps")]
        eps: f32,
    },
    Eltwise {
        #[serde(default)]
        operation: EltwiseOp,
        #[serde(default)]
        coeffs: Vec<f32>,
    },
}

impl OpParam {
    /// Operator tag as written in parameter files.
    pub fn type_name(&self) -> &'static str {
        match self {
            OpParam::Input { .. } => "Input",
            OpParam::Relu { .. } => "ReLU",
            OpParam::Softmax {} => "Softmax",
            OpParam::InnerProduct { .. } => "InnerProduct",
            OpParam::Convolution { .. } => "Convolution",
            OpParam::Pooling { .. } => "Pooling",
            OpParam::Scale { .. } => "Scale",
            OpParam::BatchNorm { .. } => "BatchNorm",
            OpParam::Eltwise { .. } => "Eltwise",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMethod {
    #[default]
    Max,
    Average,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EltwiseOp {
    Prod,
    #[default]
    Sum,
    Max,
}

fn one() -> usize {
    1
}

fn yes() -> bool {
    true
}

fn default_eps() -> f32 {
    1e-5
}

/// Raw weight tensor: dimensions plus row-major values.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightBlob {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl WeightBlob {
    /// Build a weight tensor, checking that `data` fills `dims`.
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self, LoadError> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(LoadError::Malformed(format!(
                "weight dims {dims:?} describe {expected} values but {} were given",
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }

    /// One-dimensional tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            dims: vec![data.len()],
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Leading dimension, the output-channel count for filter banks.
    pub fn leading_dim(&self) -> usize {
        self.dims.first().copied().unwrap_or(0)
    }
}

/// Weight tensors grouped by layer index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelWeights {
    layers: BTreeMap<usize, BTreeMap<usize, WeightBlob>>,
}

impl ModelWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next weight tensor of `layer_index`.
    pub fn push(&mut self, layer_index: usize, blob: WeightBlob) -> &mut Self {
        let blobs = self.layers.entry(layer_index).or_default();
        let next = blobs.keys().next_back().map_or(0, |last| last + 1);
        blobs.insert(next, blob);
        self
    }

    pub fn insert(&mut self, layer_index: usize, blob_index: usize, blob: WeightBlob) {
        self.layers
            .entry(layer_index)
            .or_default()
            .insert(blob_index, blob);
    }

    /// Weight tensors of one layer in blob order.
    pub fn layer(&self, layer_index: usize) -> Vec<WeightBlob> {
        self.layers
            .get(&layer_index)
            .map(|blobs| blobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Indices of every layer that has weights.
    pub fn layer_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.layers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let file = fs::File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::read_from(std::io::BufReader::new(file))
    }

    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<(), LoadError> {
        let path = path.as_ref();
        let file = fs::File::create(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = std::io::BufWriter::new(file);
        self.write_to(&mut writer)
            .and_then(|_| writer.flush())
            .map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Decode the binary container.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, LoadError> {
        let mut magic = [0u8; 4];
        read_exact(&mut reader, &mut magic)?;
        if &magic != WEIGHTS_MAGIC {
            return Err(LoadError::BadMagic {
                found: u32::from_le_bytes(magic),
                expected: u32::from_le_bytes(*WEIGHTS_MAGIC),
            });
        }
        let version = read_u32(&mut reader)?;
        if version != WEIGHTS_VERSION {
            return Err(LoadError::Malformed(format!(
                "unsupported weight container version {version}"
            )));
        }
        let records = read_u32(&mut reader)?;

        let mut weights = ModelWeights::new();
        for _ in 0..records {
            let layer_index = read_u32(&mut reader)? as usize;
            let blob_index = read_u32(&mut reader)? as usize;
            let ndims = read_u32(&mut reader)? as usize;
            if ndims == 0 || ndims > 8 {
                return Err(LoadError::Malformed(format!(
                    "weight record for layer {layer_index} has {ndims} dimensions"
                )));
            }
            let mut dims = Vec::with_capacity(ndims);
            for _ in 0..ndims {
                dims.push(read_u32(&mut reader)? as usize);
            }
            let count = dims
                .iter()
                .try_fold(1usize, |acc, d| acc.checked_mul(*d))
                .ok_or_else(|| LoadError::Malformed(format!("weight dims {dims:?} overflow")))?;
            let mut bytes = vec![0u8; count * 4];
            read_exact(&mut reader, &mut bytes)?;
            let data = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            weights.insert(layer_index, blob_index, WeightBlob { dims, data });
        }
        Ok(weights)
    }

    /// Encode the binary container.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let records: usize = self.layers.values().map(BTreeMap::len).sum();
        writer.write_all(WEIGHTS_MAGIC)?;
        writer.write_all(&WEIGHTS_VERSION.to_le_bytes())?;
        writer.write_all(&(records as u32).to_le_bytes())?;
        for (layer_index, blobs) in &self.layers {
            for (blob_index, blob) in blobs {
                writer.write_all(&(*layer_index as u32).to_le_bytes())?;
                writer.write_all(&(*blob_index as u32).to_le_bytes())?;
                writer.write_all(&(blob.dims.len() as u32).to_le_bytes())?;
                for dim in &blob.dims {
                    writer.write_all(&(*dim as u32).to_le_bytes())?;
                }
                for value in &blob.data {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
        }
        Ok(())
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), LoadError> {
    reader
        .read_exact(buf)
        .map_err(|e| LoadError::Malformed(format!("truncated weight stream: {e}")))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, LoadError> {
    let mut bytes = [0u8; 4];
    read_exact(reader, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}
