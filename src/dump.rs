//! Text rendering of parse nodes: labels, value previews and an indented tree dump.

use std::fmt::Write as _;

use crate::engine::ObjId;
use crate::tree::{NodeId, NodeValue, ParseNode, ParseTreeModel, TreeError};
use crate::value::Value;

/// Longest byte array shown in full; longer ones are cut with a byte count.
const BYTES_PREVIEW: usize = 16;

/// Raw scalar string.
pub fn format_scalar(v: &Value) -> String {
    match v {
        Value::U8(x) => format!("{}", x),
        Value::U16(x) => format!("{}", x),
        Value::U32(x) => format!("{}", x),
        Value::U64(x) => format!("{}", x),
        Value::I8(x) => format!("{}", x),
        Value::I16(x) => format!("{}", x),
        Value::I32(x) => format!("{}", x),
        Value::I64(x) => format!("{}", x),
        Value::Bool(x) => format!("{}", x),
        Value::Float(x) => format!("{}", x),
        Value::Double(x) => format!("{}", x),
        Value::Str(s) => format!("{:?}", s),
        Value::Bytes(b) if b.len() > BYTES_PREVIEW => {
            format!("[{} ...] ({} bytes)", hex_string(&b[..BYTES_PREVIEW]), b.len())
        }
        Value::Bytes(b) => format!("[{}]", hex_string(b)),
        Value::Enum {
            name,
            value,
            label: Some(label),
            ..
        } => format!("{}::{} ({})", name, label, value),
        Value::Enum { name, value, .. } => format!("{}::? ({})", name, value),
        Value::Null => "null".to_string(),
    }
}

fn hex_string(b: &[u8]) -> String {
    b.iter().map(|x| format!("{:02x}", x)).collect::<Vec<_>>().join(" ")
}

/// `name [type]`, as shown in the tree column.
pub fn node_label(node: &ParseNode) -> String {
    format!("{} [{}]", node.name, node.type_name)
}

/// One-line value preview of a node.
pub fn node_value_text(node: &ParseNode) -> String {
    match &node.value {
        NodeValue::Scalar(v) => format_scalar(v),
        NodeValue::Struct => String::new(),
        NodeValue::Array { len } => format!("{} item(s)", len),
        NodeValue::Pending => "...".to_string(),
    }
}

fn offsets_text(node: &ParseNode) -> String {
    match node.range() {
        Some((start, end)) => format!("{:#06x}..{:#06x}", start, end),
        None => "-".to_string(),
    }
}

/// Indented dump of the tree, expanding every node (instances included) down to `max_depth`.
///
/// A struct already open on the current path (e.g. an instance with `value: _root`) is
/// printed once more as `<cycle>` and not expanded again.
pub fn dump_tree(
    model: &mut ParseTreeModel,
    max_depth: Option<usize>,
    with_offsets: bool,
) -> Result<String, TreeError> {
    let root = model.root()?;
    let mut out = String::new();
    let mut open = Vec::new();
    dump_node(model, root, 0, max_depth, with_offsets, &mut open, &mut out)?;
    Ok(out)
}

fn dump_node(
    model: &mut ParseTreeModel,
    id: NodeId,
    depth: usize,
    max_depth: Option<usize>,
    with_offsets: bool,
    open: &mut Vec<ObjId>,
    out: &mut String,
) -> Result<(), TreeError> {
    model.resolve(id)?;
    let obj = model.object_of(id)?;
    let cycle = obj.map_or(false, |o| open.contains(&o));
    let node = model.node(id)?;
    let pad = "  ".repeat(depth);
    let value = if cycle {
        "<cycle>".to_string()
    } else {
        node_value_text(node)
    };
    let _ = write!(out, "{}{}", pad, node_label(node));
    if !value.is_empty() {
        let _ = write!(out, " = {}", value);
    }
    if with_offsets {
        let _ = write!(out, "  @ {}", offsets_text(node));
    }
    out.push('\n');
    if cycle || !node.has_children() || max_depth.map_or(false, |m| depth >= m) {
        return Ok(());
    }
    open.extend(obj);
    for child in model.children_of(id)? {
        dump_node(model, child, depth + 1, max_depth, with_offsets, open, out)?;
    }
    if obj.is_some() {
        open.pop();
    }
    Ok(())
}
