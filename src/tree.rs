//! Parse tree model: a lazily materialized view over a [`DecodedTree`].
//!
//! The model decodes on the first [`ParseTreeModel::root`] call and then creates nodes one
//! level at a time as the host expands them. Instances appear as [`NodeValue::Pending`]
//! until they are expanded or resolved; evaluation failures surface as [`TreeError::Decode`]
//! with the full node path.
//!
//! Node ids carry the model generation. [`ParseTreeModel::invalidate`] (and the setters that
//! imply it) bumps the generation, so ids handed out before are rejected as stale rather than
//! silently pointing into a new tree.

use std::sync::Arc;

use crate::ast::{DecoderDefinition, FieldKind};
use crate::engine::{
    decode, DecodeError, DecodeOptions, DecodedTree, FieldData, FieldRecord, InstanceSlot, ObjId,
    RecordLoc, Slot,
};
use crate::stream::{BinaryData, ByteSource};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    generation: u64,
    index: usize,
}

impl NodeId {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Scalar(Value),
    Struct,
    Array { len: usize },
    /// Instance that has not been evaluated yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq)]
enum Origin {
    Root,
    Record(RecordLoc),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseNode {
    pub name: String,
    pub type_name: String,
    pub kind: FieldKind,
    pub value: NodeValue,
    /// Absolute offsets into the buffer; absent for computed instances.
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub parent: Option<NodeId>,
    origin: Origin,
    children: Option<Vec<NodeId>>,
}

impl ParseNode {
    pub fn range(&self) -> Option<(u64, u64)> {
        Some((self.start?, self.end?))
    }

    pub fn is_expanded(&self) -> bool {
        self.children.is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.value == NodeValue::Pending
    }

    /// Whether the node may have children (structs and arrays, or an unevaluated instance).
    pub fn has_children(&self) -> bool {
        matches!(
            self.value,
            NodeValue::Struct | NodeValue::Array { .. } | NodeValue::Pending
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("node {0:?} belongs to an invalidated tree")]
    StaleNode(NodeId),
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
}

struct TreeState {
    decoded: DecodedTree,
    nodes: Vec<ParseNode>,
}

pub struct ParseTreeModel {
    definition: Arc<DecoderDefinition>,
    data: Arc<dyn BinaryData + Send + Sync>,
    options: DecodeOptions,
    generation: u64,
    state: Option<TreeState>,
}

impl std::fmt::Debug for ParseTreeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParseTreeModel")
            .field("definition", &self.definition.id)
            .field("size", &self.data.size())
            .field("generation", &self.generation)
            .field("nodes", &self.state.as_ref().map_or(0, |s| s.nodes.len()))
            .finish()
    }
}

impl ParseTreeModel {
    pub fn new(
        definition: Arc<DecoderDefinition>,
        data: Arc<dyn BinaryData + Send + Sync>,
    ) -> Self {
        ParseTreeModel::with_options(definition, data, DecodeOptions::default())
    }

    pub fn with_options(
        definition: Arc<DecoderDefinition>,
        data: Arc<dyn BinaryData + Send + Sync>,
        options: DecodeOptions,
    ) -> Self {
        ParseTreeModel {
            definition,
            data,
            options,
            generation: 0,
            state: None,
        }
    }

    pub fn definition(&self) -> &Arc<DecoderDefinition> {
        &self.definition
    }

    pub fn data(&self) -> &Arc<dyn BinaryData + Send + Sync> {
        &self.data
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The decode result, once [`root`](Self::root) has succeeded.
    pub fn decoded(&self) -> Option<&DecodedTree> {
        self.state.as_ref().map(|s| &s.decoded)
    }

    /// Number of nodes materialized so far.
    pub fn node_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.nodes.len())
    }

    /// Root node, decoding the buffer on first use.
    pub fn root(&mut self) -> Result<NodeId, TreeError> {
        if self.state.is_none() {
            let source = ByteSource::new(&*self.data);
            let decoded = decode(&self.definition, source, &self.options)?;
            let (start, end) = decoded.range();
            let root = ParseNode {
                name: "[root]".to_string(),
                type_name: self.definition.root().name.clone(),
                kind: FieldKind::Compound,
                value: NodeValue::Struct,
                start: Some(start),
                end: Some(end),
                parent: None,
                origin: Origin::Root,
                children: None,
            };
            self.state = Some(TreeState {
                decoded,
                nodes: vec![root],
            });
        }
        Ok(self.id(0))
    }

    fn id(&self, index: usize) -> NodeId {
        NodeId {
            generation: self.generation,
            index,
        }
    }

    fn state(&self, id: NodeId) -> Result<&TreeState, TreeError> {
        if id.generation != self.generation {
            return Err(TreeError::StaleNode(id));
        }
        match &self.state {
            Some(state) if id.index < state.nodes.len() => Ok(state),
            _ => Err(TreeError::UnknownNode(id)),
        }
    }

    pub fn node(&self, id: NodeId) -> Result<&ParseNode, TreeError> {
        Ok(&self.state(id)?.nodes[id.index])
    }

    pub fn range_of(&self, id: NodeId) -> Result<Option<(u64, u64)>, TreeError> {
        Ok(self.node(id)?.range())
    }

    pub fn is_expanded(&self, id: NodeId) -> Result<bool, TreeError> {
        Ok(self.node(id)?.is_expanded())
    }

    /// Decoded struct a node stands for; `None` for scalars, arrays and pending instances.
    pub fn object_of(&self, id: NodeId) -> Result<Option<ObjId>, TreeError> {
        let state = self.state(id)?;
        Ok(match &state.nodes[id.index].origin {
            Origin::Root => Some(ObjId::ROOT),
            Origin::Record(loc) => match state.decoded.record(loc).map(|r| &r.data) {
                Some(FieldData::Struct(obj)) => Some(*obj),
                _ => None,
            },
        })
    }

    /// Dotted path of a node, rooted at the schema id (`png.chunks[3].len`).
    pub fn path_of(&self, id: NodeId) -> Result<String, TreeError> {
        let state = self.state(id)?;
        let mut segments = Vec::new();
        let mut cur = Some(id.index);
        while let Some(i) = cur {
            let node = &state.nodes[i];
            match node.parent {
                Some(p) => {
                    segments.push(node.name.as_str());
                    cur = Some(p.index);
                }
                None => {
                    segments.push(self.definition.id.as_str());
                    cur = None;
                }
            }
        }
        let mut path = String::new();
        for seg in segments.iter().rev() {
            if !path.is_empty() && !seg.starts_with('[') {
                path.push('.');
            }
            path.push_str(seg);
        }
        Ok(path)
    }

    /// Evaluate a pending instance node in place; a no-op for every other node.
    pub fn resolve(&mut self, id: NodeId) -> Result<&ParseNode, TreeError> {
        let (obj, idx) = match &self.node(id)?.origin {
            Origin::Record(RecordLoc {
                obj,
                slot: Slot::Instance(idx),
                items,
            }) if items.is_empty() => (*obj, *idx),
            _ => return self.node(id),
        };
        if !self.node(id)?.is_pending() {
            return self.node(id);
        }
        let parent_path = match self.node(id)?.parent {
            Some(p) => self.path_of(p)?,
            None => self.definition.id.clone(),
        };
        let ParseTreeModel {
            data,
            options,
            state,
            ..
        } = self;
        let state = state.as_mut().ok_or(TreeError::UnknownNode(id))?;
        let record = state
            .decoded
            .ensure_instance(&**data, obj, idx, &options.cancel)
            .map_err(|e| e.within(&parent_path))?
            .clone();
        log::trace!("resolved instance {}.{}", parent_path, record.name);
        let node = &mut state.nodes[id.index];
        let (value, kind) = node_value(&record, FieldKind::Instance);
        node.type_name = record.type_name;
        node.value = value;
        node.kind = kind;
        node.start = record.range.map(|r| r.0);
        node.end = record.range.map(|r| r.1);
        Ok(&state.nodes[id.index])
    }

    /// Children of `id`, materializing them on the first call.
    pub fn children_of(&mut self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        if let Some(children) = &self.node(id)?.children {
            return Ok(children.clone());
        }
        self.resolve(id)?;
        let generation = self.generation;
        let state = self.state.as_mut().ok_or(TreeError::UnknownNode(id))?;
        let origin = state.nodes[id.index].origin.clone();
        let mut fresh = Vec::new();
        match origin {
            Origin::Root => struct_children(&state.decoded, ObjId::ROOT, &mut fresh),
            Origin::Record(loc) => {
                if let Some(rec) = state.decoded.record(&loc) {
                    match &rec.data {
                        FieldData::Struct(obj) => struct_children(&state.decoded, *obj, &mut fresh),
                        FieldData::Array(items) => {
                            for (i, item) in items.iter().enumerate() {
                                let mut at = loc.clone();
                                at.items.push(i);
                                fresh.push(record_node(item, FieldKind::Primitive, at));
                            }
                        }
                        FieldData::Scalar(_) => {}
                    }
                }
            }
        }
        let mut ids = Vec::with_capacity(fresh.len());
        for mut node in fresh {
            node.parent = Some(id);
            ids.push(NodeId {
                generation,
                index: state.nodes.len(),
            });
            state.nodes.push(node);
        }
        state.nodes[id.index].children = Some(ids.clone());
        Ok(ids)
    }

    /// Drop the tree; the next [`root`](Self::root) decodes again under a new generation.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.state = None;
        log::debug!("tree invalidated, generation {}", self.generation);
    }

    pub fn set_data(&mut self, data: Arc<dyn BinaryData + Send + Sync>) {
        self.data = data;
        self.invalidate();
    }

    pub fn set_definition(&mut self, definition: Arc<DecoderDefinition>) {
        self.definition = definition;
        self.invalidate();
    }

    pub fn set_options(&mut self, options: DecodeOptions) {
        self.options = options;
        self.invalidate();
    }
}

fn struct_children(decoded: &DecodedTree, obj: ObjId, out: &mut Vec<ParseNode>) {
    let object = decoded.object(obj);
    let ty = decoded.type_of(obj);
    for (i, rec) in object.fields.iter().enumerate() {
        let kind = ty
            .seq
            .iter()
            .find(|f| f.id == rec.name)
            .map_or(FieldKind::Primitive, |f| f.kind());
        let loc = RecordLoc {
            obj,
            slot: Slot::Field(i),
            items: Vec::new(),
        };
        out.push(record_node(rec, kind, loc));
    }
    for (j, inst) in ty.instances.iter().enumerate() {
        let loc = RecordLoc {
            obj,
            slot: Slot::Instance(j),
            items: Vec::new(),
        };
        match &object.instances[j] {
            InstanceSlot::Done(rec) => out.push(record_node(rec, FieldKind::Instance, loc)),
            _ => out.push(ParseNode {
                name: inst.name.clone(),
                type_name: "instance".to_string(),
                kind: FieldKind::Instance,
                value: NodeValue::Pending,
                start: None,
                end: None,
                parent: None,
                origin: Origin::Record(loc),
                children: None,
            }),
        }
    }
}

fn node_value(rec: &FieldRecord, kind: FieldKind) -> (NodeValue, FieldKind) {
    match &rec.data {
        FieldData::Scalar(v) => (NodeValue::Scalar(v.clone()), kind),
        FieldData::Struct(_) => (
            NodeValue::Struct,
            if kind == FieldKind::Primitive {
                FieldKind::Compound
            } else {
                kind
            },
        ),
        FieldData::Array(items) => (
            NodeValue::Array { len: items.len() },
            if kind == FieldKind::Primitive {
                FieldKind::Array
            } else {
                kind
            },
        ),
    }
}

fn record_node(rec: &FieldRecord, kind: FieldKind, loc: RecordLoc) -> ParseNode {
    let (value, kind) = node_value(rec, kind);
    ParseNode {
        name: rec.name.clone(),
        type_name: rec.type_name.clone(),
        kind,
        value,
        start: rec.range.map(|r| r.0),
        end: rec.range.map(|r| r.1),
        parent: None,
        origin: Origin::Record(loc),
        children: None,
    }
}
