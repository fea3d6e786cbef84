//! Decoder definition: the static, executable form of a compiled schema.
//!
//! A [`DecoderDefinition`] is produced once per schema identity by a
//! [`SchemaCompiler`](crate::compiler::SchemaCompiler) and interpreted by the engine. Types and
//! enums live in flat tables addressed by [`TypeId`] / [`EnumId`]; nested scopes are kept as
//! name maps so lookups follow the schema's lexical nesting.

use std::collections::HashMap;

use crate::expr::Expr;
use crate::stream::Endianness;
use crate::value::{Encoding, Value};

pub type TypeId = usize;
pub type EnumId = usize;

/// Which schema a definition was compiled from: canonical URI plus a digest of the content.
///
/// Two files declaring the same `meta/id` (or sharing a file name) stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaIdentity {
    pub uri: String,
    pub digest: [u8; 32],
}

impl SchemaIdentity {
    pub fn new(uri: impl Into<String>, content: &[u8]) -> Self {
        SchemaIdentity {
            uri: uri.into(),
            digest: *blake3::hash(content).as_bytes(),
        }
    }

    pub fn digest_hex(&self) -> String {
        self.digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DecoderDefinition {
    /// `meta/id` of the root type.
    pub id: String,
    pub identity: SchemaIdentity,
    pub compiler_version: String,
    /// All user types; index 0 is the root.
    pub types: Vec<TypeDef>,
    pub enums: Vec<EnumDef>,
}

impl DecoderDefinition {
    pub const ROOT: TypeId = 0;

    pub fn root(&self) -> &TypeDef {
        &self.types[Self::ROOT]
    }

    pub fn get_type(&self, id: TypeId) -> &TypeDef {
        &self.types[id]
    }

    pub fn get_enum(&self, id: EnumId) -> &EnumDef {
        &self.enums[id]
    }

    /// Parameters of the root type, in declared order.
    pub fn params(&self) -> &[ParamDef] {
        &self.root().params
    }

    pub fn param_names(&self) -> Vec<&str> {
        self.params().iter().map(|p| p.name.as_str()).collect()
    }

    /// Zero value for every root parameter; used when the caller supplies none.
    pub fn default_arguments(&self) -> Vec<Value> {
        self.params().iter().map(|p| p.ty.zero_value()).collect()
    }

    /// Resolve a (possibly `::`-qualified) type name as seen from inside `from`.
    pub fn resolve_type(&self, from: TypeId, path: &[&str]) -> Option<TypeId> {
        let (first, rest) = path.split_first()?;
        let mut scope = Some(from);
        let mut found = None;
        while let Some(s) = scope {
            let ty = self.get_type(s);
            if let Some(id) = ty.types.get(*first) {
                found = Some(*id);
                break;
            }
            scope = ty.parent_scope;
        }
        let mut id = match found {
            Some(id) => id,
            None if *first == self.root().name => Self::ROOT,
            None => return None,
        };
        for seg in rest {
            id = *self.get_type(id).types.get(*seg)?;
        }
        Some(id)
    }

    /// Resolve an enum reference (`name`, or `type::name`) as seen from inside `from`.
    pub fn resolve_enum<S: AsRef<str>>(&self, from: TypeId, path: &[S]) -> Option<EnumId> {
        let (name, scopes) = path.split_last()?;
        let owner = if scopes.is_empty() {
            let mut scope = Some(from);
            while let Some(s) = scope {
                let ty = self.get_type(s);
                if let Some(id) = ty.enums.get(name.as_ref()) {
                    return Some(*id);
                }
                scope = ty.parent_scope;
            }
            return None;
        } else {
            let segs: Vec<&str> = scopes.iter().map(|s| s.as_ref()).collect();
            self.resolve_type(from, &segs)?
        };
        self.get_type(owner).enums.get(name.as_ref()).copied()
    }
}

#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    /// Scope path from the root, e.g. `["png", "chunk"]`.
    pub path: Vec<String>,
    pub parent_scope: Option<TypeId>,
    pub params: Vec<ParamDef>,
    pub seq: Vec<FieldDef>,
    pub instances: Vec<InstanceDef>,
    pub types: HashMap<String, TypeId>,
    pub enums: HashMap<String, EnumId>,
    pub endian: Option<Endianness>,
    pub bit_endian: Endianness,
    pub encoding: Option<Encoding>,
    pub doc: Option<String>,
}

impl TypeDef {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.seq.iter().position(|f| f.id == name)
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn instance_index(&self, name: &str) -> Option<usize> {
        self.instances.iter().position(|i| i.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    pub name: String,
    pub ty: ParamType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
    Bytes,
    /// User type, stream, or untyped parameter.
    Any,
}

impl ParamType {
    pub fn zero_value(self) -> Value {
        match self {
            ParamType::Int => Value::I64(0),
            ParamType::Float => Value::Double(0.0),
            ParamType::Bool => Value::Bool(false),
            ParamType::Str => Value::Str(String::new()),
            ParamType::Bytes => Value::Bytes(Vec::new()),
            ParamType::Any => Value::Null,
        }
    }
}

/// Tagged kind of a field, as presented to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Primitive,
    Compound,
    Array,
    Conditional,
    Instance,
}

/// One `seq` entry (also the body of a parse instance).
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub id: String,
    pub read: ReadSpec,
    pub repeat: Repeat,
    pub condition: Option<Expr>,
    pub enum_ref: Option<EnumId>,
    pub valid: Option<Validation>,
    /// Magic bytes the field must match.
    pub contents: Option<Vec<u8>>,
    pub doc: Option<String>,
}

impl FieldDef {
    pub fn kind(&self) -> FieldKind {
        if self.condition.is_some() {
            FieldKind::Conditional
        } else if self.repeat != Repeat::None {
            FieldKind::Array
        } else if matches!(self.read, ReadSpec::User { .. } | ReadSpec::Switch { .. }) {
            FieldKind::Compound
        } else {
            FieldKind::Primitive
        }
    }
}

/// How a single value is read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadSpec {
    Int {
        width: usize,
        signed: bool,
        endian: Endianness,
    },
    Float {
        width: usize,
        endian: Endianness,
    },
    BitInt {
        width: u32,
        endian: Endianness,
    },
    Bytes(BytesSpec),
    Str {
        bytes: BytesSpec,
        encoding: Encoding,
        zero_terminated: bool,
    },
    User {
        type_id: TypeId,
        args: Vec<Expr>,
        /// Present when the type is parsed from a bounded substream.
        bytes: Option<BytesSpec>,
    },
    Switch {
        on: Expr,
        cases: Vec<(Expr, ReadSpec)>,
        default: Option<Box<ReadSpec>>,
    },
}

impl ReadSpec {
    pub fn type_name(&self, def: &DecoderDefinition) -> String {
        match self {
            ReadSpec::Int {
                width,
                signed,
                endian,
            } => {
                let prefix = if *signed { 's' } else { 'u' };
                if *width == 1 {
                    format!("{}1", prefix)
                } else {
                    format!("{}{}{}", prefix, width, endian.suffix())
                }
            }
            ReadSpec::Float { width, endian } => format!("f{}{}", width, endian.suffix()),
            ReadSpec::BitInt { width, .. } => format!("b{}", width),
            ReadSpec::Bytes(_) => "bytes".to_string(),
            ReadSpec::Str {
                zero_terminated, ..
            } => (if *zero_terminated { "strz" } else { "str" }).to_string(),
            ReadSpec::User { type_id, .. } => def.get_type(*type_id).name.clone(),
            ReadSpec::Switch { .. } => "switch".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BytesSpec {
    pub size: SizeSpec,
    pub terminator: Option<Terminator>,
    pub pad_right: Option<u8>,
    pub process: Option<Process>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizeSpec {
    Expr(Expr),
    /// Everything up to the end of the current stream.
    Eos,
    /// Up to the terminator; `BytesSpec::terminator` is always set.
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Terminator {
    pub bytes: Vec<u8>,
    pub include: bool,
    pub consume: bool,
    pub eos_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Process {
    /// Key is a single byte or a byte array, repeated over the data.
    Xor(Expr),
    Rol(Expr),
    Ror(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Repeat {
    None,
    Eos,
    Expr(Expr),
    Until(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Eq(Expr),
    AnyOf(Vec<Expr>),
    Range {
        min: Option<Expr>,
        max: Option<Expr>,
    },
    /// Boolean expression over `_`.
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct InstanceDef {
    pub name: String,
    pub kind: InstanceKind,
    pub doc: Option<String>,
}

impl InstanceDef {
    pub fn kind(&self) -> FieldKind {
        FieldKind::Instance
    }
}

#[derive(Debug, Clone)]
pub enum InstanceKind {
    /// Computed from an expression; has no byte range.
    Value {
        expr: Expr,
        enum_ref: Option<EnumId>,
        condition: Option<Expr>,
    },
    /// Parsed on demand, optionally at `pos` in another stream (`io`).
    Parse {
        pos: Option<Expr>,
        io: Option<Expr>,
        field: FieldDef,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDef {
    pub name: String,
    pub variants: Vec<(i128, String)>,
}

impl EnumDef {
    pub fn label(&self, value: i128) -> Option<&str> {
        self.variants
            .iter()
            .find(|(v, _)| *v == value)
            .map(|(_, l)| l.as_str())
    }

    pub fn value_of(&self, label: &str) -> Option<i128> {
        self.variants
            .iter()
            .find(|(_, l)| l == label)
            .map(|(v, _)| *v)
    }
}
