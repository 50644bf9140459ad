//! Layer graph: an arena of nodes and blobs addressed by index.
//!
//! Node order is the execution order and is a valid topological order of the
//! dataflow. In-place records (`top == bottom`) are rewritten into single
//! assignment form at construction: the newest version of a blob keeps the
//! public name and superseded versions become `name#producer`. Fusion marks
//! absorbed nodes as removed instead of shifting the arena, so every
//! [`BlobId`] and node index stays stable.

use std::collections::{HashMap, HashSet};

use log::debug;

use crate::blob::Blob;
use crate::error::{LayerError, LoadError};
use crate::layers::{Layer, create_layer};
use crate::param::{ModelWeights, NetParam, OpParam};

pub type BlobId = usize;

/// One layer instance and its wiring.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub layer: Box<dyn Layer>,
    pub bottoms: Vec<BlobId>,
    pub top: BlobId,
    pub removed: bool,
}

#[derive(Debug, Default)]
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) blobs: Vec<Blob>,
    names: HashMap<String, BlobId>,
    inputs: Vec<BlobId>,
    /// Name each input was declared with; renaming never touches it.
    input_names: Vec<String>,
    fused: bool,
}

impl Graph {
    /// Materialize nodes and blobs from parsed layer records.
    pub fn from_param(param: &NetParam) -> Result<Self, LoadError> {
        param.validate()?;
        let mut graph = Graph::default();
        let mut layer_names = HashSet::new();
        // Index of the node that produced each blob.
        let mut producers: Vec<usize> = Vec::new();

        for (index, record) in param.layers.iter().enumerate() {
            if !layer_names.insert(record.name.as_str()) {
                return Err(LoadError::DuplicateLayer(record.name.clone()));
            }
            let layer = create_layer(&record.op);
            if record.bottom.len() != layer.arity() {
                return Err(LoadError::Layer {
                    layer: record.name.clone(),
                    reason: format!(
                        "{} takes {} bottom blob(s), got {}",
                        layer.type_name(),
                        layer.arity(),
                        record.bottom.len()
                    ),
                });
            }

            let bottoms = record
                .bottom
                .iter()
                .map(|blob| {
                    graph
                        .names
                        .get(blob)
                        .copied()
                        .ok_or_else(|| LoadError::UnknownBottom {
                            layer: record.name.clone(),
                            blob: blob.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let top_name = &record.top[0];
            if let Some(previous) = graph.names.remove(top_name) {
                let renamed = format!("{top_name}#{}", graph.nodes[producers[previous]].name);
                debug!(
                    target: "feather::net",
                    "blob '{top_name}' rewritten by '{}'; previous version is now '{renamed}'",
                    record.name
                );
                graph.blobs[previous].rename(renamed.clone());
                graph.names.insert(renamed, previous);
            }
            let top = graph.blobs.len();
            graph.blobs.push(Blob::new(top_name.clone()));
            graph.names.insert(top_name.clone(), top);
            producers.push(index);

            if matches!(record.op, OpParam::Input { .. }) {
                graph.inputs.push(top);
                graph.input_names.push(top_name.clone());
            }
            graph.nodes.push(Node {
                name: record.name.clone(),
                layer,
                bottoms,
                top,
                removed: false,
            });
        }
        Ok(graph)
    }

    /// Hand each layer the weight blobs recorded under its index.
    pub fn bind_weights(&mut self, weights: &ModelWeights) -> Result<(), LoadError> {
        if let Some(index) = weights.layer_indices().find(|&i| i >= self.nodes.len()) {
            return Err(LoadError::WeightMismatch {
                layer: format!("#{index}"),
                reason: format!("weights for a layer index beyond {} layers", self.nodes.len()),
            });
        }
        for (index, node) in self.nodes.iter_mut().enumerate() {
            node.layer
                .bind_weights(weights.layer(index))
                .map_err(|reason| LoadError::WeightMismatch {
                    layer: node.name.clone(),
                    reason,
                })?;
        }
        Ok(())
    }

    /// Propagate shapes through the live nodes in order.
    ///
    /// Returns the failing layer's name alongside its error.
    pub fn infer_shapes(&mut self) -> Result<(), (String, LayerError)> {
        for node in self.nodes.iter_mut().filter(|node| !node.removed) {
            let shapes: Vec<_> = node.bottoms.iter().map(|&b| self.blobs[b].shape()).collect();
            let shape = node
                .layer
                .infer_shape(&shapes)
                .map_err(|error| (node.name.clone(), error))?;
            self.blobs[node.top].set_shape(shape);
        }
        Ok(())
    }

    /// Fold absorbable successors into their predecessors.
    ///
    /// A pair fuses only when the successor is the next live node, it is the
    /// sole reader of the predecessor's output and both outputs agree in
    /// shape. The predecessor then writes straight into the successor's top,
    /// so the public blob name survives. Returns the number of nodes removed.
    pub fn fuse(&mut self) -> usize {
        if self.fused {
            return 0;
        }
        self.fused = true;
        let mut removed = 0;
        let mut i = 0;
        while i < self.nodes.len() {
            if self.nodes[i].removed || !self.nodes[i].layer.fusible() {
                i += 1;
                continue;
            }
            let top = self.nodes[i].top;
            let next = self.next_live(i);
            let candidate = match (self.consumers(top).as_slice(), next) {
                (&[only], Some(next)) if only == next => Some(next),
                _ => None,
            };
            let Some(j) = candidate.filter(|&j| {
                self.nodes[j].bottoms.len() == 1
                    && self.blobs[self.nodes[j].top].shape() == self.blobs[top].shape()
            }) else {
                i += 1;
                continue;
            };

            let (head, tail) = self.nodes.split_at_mut(j);
            let (pred, succ) = (&mut head[i], &mut tail[0]);
            if !pred.layer.fuse(succ.layer.as_ref()) {
                i += 1;
                continue;
            }
            debug!(
                target: "feather::net",
                "fused {} '{}' into {} '{}'",
                succ.layer.type_name(),
                succ.name,
                pred.layer.type_name(),
                pred.name
            );
            succ.removed = true;
            pred.top = succ.top;
            let old_name = self.blobs[top].name().to_string();
            if self.names.get(&old_name) == Some(&top) {
                self.names.remove(&old_name);
            }
            removed += 1;
            // Stay on `i`: a node may absorb a chain (BatchNorm, Scale, ReLU).
        }
        removed
    }

    fn next_live(&self, index: usize) -> Option<usize> {
        (index + 1..self.nodes.len()).find(|&j| !self.nodes[j].removed)
    }

    /// Live nodes reading `blob`, in order.
    pub fn consumers(&self, blob: BlobId) -> Vec<usize> {
        self.live_nodes()
            .filter(|(_, node)| node.bottoms.contains(&blob))
            .map(|(index, _)| index)
            .collect()
    }

    /// Blobs produced by a live node and read by none.
    pub fn outputs(&self) -> Vec<BlobId> {
        let read: HashSet<BlobId> = self
            .live_nodes()
            .flat_map(|(_, node)| node.bottoms.iter().copied())
            .collect();
        self.live_nodes()
            .map(|(_, node)| node.top)
            .filter(|top| !read.contains(top))
            .collect()
    }

    pub fn inputs(&self) -> &[BlobId] {
        &self.inputs
    }

    /// Resolve an input by its declared name, even after an in-place layer
    /// took that name over.
    pub fn input_id(&self, name: &str) -> Option<BlobId> {
        self.input_names
            .iter()
            .position(|declared| declared == name)
            .map(|index| self.inputs[index])
    }

    /// Declared name of the input stored in `blob`.
    pub fn input_name(&self, blob: BlobId) -> Option<&str> {
        self.inputs
            .iter()
            .position(|&id| id == blob)
            .map(|index| self.input_names[index].as_str())
    }

    /// Every live node reads only blobs written by earlier live nodes, and
    /// every blob is written at most once.
    pub fn validate_topology(&self) -> Result<(), LoadError> {
        let mut produced = HashSet::new();
        for (_, node) in self.live_nodes() {
            if let Some(&missing) = node.bottoms.iter().find(|b| !produced.contains(*b)) {
                return Err(LoadError::UnknownBottom {
                    layer: node.name.clone(),
                    blob: self.blobs[missing].name().to_string(),
                });
            }
            if !produced.insert(node.top) {
                return Err(LoadError::Layer {
                    layer: node.name.clone(),
                    reason: format!("blob '{}' written twice", self.blobs[node.top].name()),
                });
            }
        }
        Ok(())
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = (usize, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.removed)
    }

    pub fn node_count(&self) -> usize {
        self.live_nodes().count()
    }

    pub fn blob_id(&self, name: &str) -> Option<BlobId> {
        self.names.get(name).copied()
    }

    pub fn blob(&self, id: BlobId) -> &Blob {
        &self.blobs[id]
    }

    pub(crate) fn blob_mut(&mut self, id: BlobId) -> &mut Blob {
        &mut self.blobs[id]
    }

    /// Index of the live node writing `blob`.
    pub fn producer(&self, blob: BlobId) -> Option<usize> {
        self.live_nodes()
            .find(|(_, node)| node.top == blob)
            .map(|(index, _)| index)
    }
}

/// Borrow a node's inputs immutably and its output mutably from one arena.
///
/// Returns `None` when an id is out of range or the output is also an input.
pub(crate) fn split_io<'a>(
    blobs: &'a mut [Blob],
    bottoms: &[BlobId],
    top: BlobId,
) -> Option<(Vec<&'a Blob>, &'a mut Blob)> {
    let mut output = None;
    let mut readable: Vec<(BlobId, &'a Blob)> = Vec::with_capacity(bottoms.len());
    for (id, blob) in blobs.iter_mut().enumerate() {
        if id == top {
            output = Some(blob);
        } else if bottoms.contains(&id) {
            let blob: &'a Blob = blob;
            readable.push((id, blob));
        }
    }
    if bottoms.contains(&top) {
        return None;
    }
    let inputs = bottoms
        .iter()
        .map(|id| {
            readable
                .iter()
                .find(|(candidate, _)| candidate == id)
                .map(|&(_, blob)| blob)
        })
        .collect::<Option<Vec<_>>>()?;
    Some((inputs, output?))
}
