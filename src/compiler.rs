//! Schema compiler seam and the built-in `.ksy` compiler.
//!
//! [`SchemaCompiler`] is the boundary to whatever turns schema text into a
//! [`DecoderDefinition`]. A compiler may report [`CompileOutput::Pending`] when its output is
//! not ready yet; the loader polls it with a bounded retry policy.
//!
//! [`KsyCompiler`] maps the YAML document into the definition in two passes: first every
//! user type and enum is allocated (so forward references resolve), then fields and
//! instances are compiled with lexical scope lookup.

use serde_yaml::Value as Yaml;

use crate::ast::{
    BytesSpec, DecoderDefinition, EnumDef, FieldDef, InstanceDef, InstanceKind, ParamDef,
    ParamType, Process, ReadSpec, Repeat, SchemaIdentity, SizeSpec, Terminator, TypeDef, TypeId,
    Validation,
};
use crate::expr::{parse_expr, parse_expr_list, Expr};
use crate::ksy::{self, KsyAttr, KsyParam, KsyType, KsyTypeRef};
use crate::stream::Endianness;
use crate::value::Encoding;

/// Everything a compiler needs to produce a definition.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub identity: SchemaIdentity,
    /// Short display name (file stem).
    pub name: String,
    pub source: String,
    pub compiler_version: String,
}

#[derive(Debug, Clone)]
pub enum CompileOutput {
    Ready(DecoderDefinition),
    /// The compiler was invoked but has not produced output yet.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot compile schema `{schema}`: {message}")]
pub struct CompileError {
    pub schema: String,
    pub message: String,
}

impl CompileError {
    pub fn new(schema: impl Into<String>, message: impl Into<String>) -> Self {
        CompileError {
            schema: schema.into(),
            message: message.into(),
        }
    }
}

pub trait SchemaCompiler: Send + Sync {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError>;

    /// Ask again after [`CompileOutput::Pending`]. Defaults to compiling again.
    fn poll(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        self.compile(request)
    }
}

/// Built-in compiler for Kaitai Struct YAML.
#[derive(Debug, Clone, Copy, Default)]
pub struct KsyCompiler;

impl KsyCompiler {
    pub fn new() -> Self {
        KsyCompiler
    }

    pub fn compile_definition(
        &self,
        request: &CompileRequest,
    ) -> Result<DecoderDefinition, CompileError> {
        let fail = |m: String| CompileError::new(request.name.clone(), m);
        let doc = ksy::from_str(&request.source).map_err(|e| fail(format!("YAML: {}", e)))?;
        let meta = doc.meta.clone().unwrap_or_default();
        let id = meta
            .id
            .clone()
            .ok_or_else(|| fail("meta/id is required".to_string()))?;
        if let Some(import) = meta.imports.first() {
            return Err(fail(format!("imports are not supported (`{}`)", import)));
        }
        let mut builder = Builder {
            def: DecoderDefinition {
                id: id.clone(),
                identity: request.identity.clone(),
                compiler_version: request.compiler_version.clone(),
                types: Vec::new(),
                enums: Vec::new(),
            },
            sources: Vec::new(),
        };
        let inherited = Inherited {
            endian: None,
            bit_endian: Endianness::Big,
            encoding: None,
        };
        builder
            .declare(&doc, &id, None, Vec::new(), inherited)
            .map_err(fail)?;
        builder.compile_bodies().map_err(fail)?;
        let def = builder.def;
        log::debug!(
            "compiled schema {} ({} types, {} enums, digest {})",
            def.id,
            def.types.len(),
            def.enums.len(),
            &def.identity.digest_hex()[..12]
        );
        Ok(def)
    }
}

impl SchemaCompiler for KsyCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        self.compile_definition(request).map(CompileOutput::Ready)
    }
}

/// Compile schema text that does not come from a file (identity `memory:<name>`).
pub fn compile_str(name: &str, source: &str) -> Result<DecoderDefinition, CompileError> {
    KsyCompiler.compile_definition(&CompileRequest {
        identity: SchemaIdentity::new(format!("memory:{}", name), source.as_bytes()),
        name: name.to_string(),
        source: source.to_string(),
        compiler_version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Clone, Copy)]
struct Inherited {
    endian: Option<Endianness>,
    bit_endian: Endianness,
    encoding: Option<Encoding>,
}

struct Builder<'k> {
    def: DecoderDefinition,
    /// YAML body of each allocated type, parallel to `def.types`.
    sources: Vec<&'k KsyType>,
}

impl<'k> Builder<'k> {
    fn declare(
        &mut self,
        ksy: &'k KsyType,
        name: &str,
        parent: Option<TypeId>,
        mut path: Vec<String>,
        inherited: Inherited,
    ) -> Result<TypeId, String> {
        path.push(name.to_string());
        let ctx = path.join("::");
        let mut scope = inherited;
        if let Some(meta) = &ksy.meta {
            if let Some(endian) = &meta.endian {
                scope.endian = Some(match endian {
                    Yaml::String(s) if s == "be" => Endianness::Big,
                    Yaml::String(s) if s == "le" => Endianness::Little,
                    Yaml::Mapping(_) => {
                        return Err(format!(
                            "{}: switchable default endianness is not supported",
                            ctx
                        ))
                    }
                    other => return Err(format!("{}: bad meta/endian {:?}", ctx, other)),
                });
            }
            if let Some(bit) = &meta.bit_endian {
                scope.bit_endian = match bit.as_str() {
                    "be" => Endianness::Big,
                    "le" => Endianness::Little,
                    other => return Err(format!("{}: bad meta/bit-endian `{}`", ctx, other)),
                };
            }
            if let Some(enc) = &meta.encoding {
                scope.encoding = Some(
                    Encoding::from_name(enc)
                        .ok_or_else(|| format!("{}: unknown encoding `{}`", ctx, enc))?,
                );
            }
        }

        let id = self.def.types.len();
        let params = ksy
            .params
            .iter()
            .map(param_def)
            .collect::<Vec<_>>();
        self.def.types.push(TypeDef {
            name: name.to_string(),
            path: path.clone(),
            parent_scope: parent,
            params,
            seq: Vec::new(),
            instances: Vec::new(),
            types: Default::default(),
            enums: Default::default(),
            endian: scope.endian,
            bit_endian: scope.bit_endian,
            encoding: scope.encoding,
            doc: ksy.doc.clone(),
        });
        self.sources.push(ksy);

        for (enum_name, entries) in ksy.enums.iter() {
            let mut variants = Vec::with_capacity(entries.len());
            for (key, label) in entries.iter() {
                let value = ksy::enum_key(key).map_err(|e| format!("{}: enums/{}: {}", ctx, enum_name, e))?;
                let label =
                    ksy::enum_label(label).map_err(|e| format!("{}: enums/{}: {}", ctx, enum_name, e))?;
                variants.push((value, label));
            }
            let enum_id = self.def.enums.len();
            self.def.enums.push(EnumDef {
                name: enum_name.clone(),
                variants,
            });
            self.def.types[id].enums.insert(enum_name.clone(), enum_id);
        }

        for (child_name, child) in ksy.types.iter() {
            let child_id = self.declare(child, child_name, Some(id), path.clone(), scope)?;
            self.def.types[id].types.insert(child_name.clone(), child_id);
        }
        Ok(id)
    }

    fn compile_bodies(&mut self) -> Result<(), String> {
        for id in 0..self.def.types.len() {
            let ksy = self.sources[id];
            let ctx = self.def.types[id].path.join("::");
            let mut names: Vec<&str> = self.def.types[id]
                .params
                .iter()
                .map(|p| p.name.as_str())
                .collect();

            let mut seq = Vec::with_capacity(ksy.seq.len());
            for (i, attr) in ksy.seq.iter().enumerate() {
                let name = attr.id.clone().unwrap_or_else(|| format!("_unnamed{}", i));
                let field = self
                    .field(id, attr, name.clone())
                    .map_err(|e| format!("{}: seq[{}] ({}): {}", ctx, i, name, e))?;
                seq.push(field);
            }

            let mut instances = Vec::with_capacity(ksy.instances.len());
            for (name, attr) in ksy.instances.iter() {
                let inst = self
                    .instance(id, name, attr)
                    .map_err(|e| format!("{}: instances/{}: {}", ctx, name, e))?;
                instances.push(inst);
            }

            for n in seq.iter().map(|f| f.id.as_str()).chain(instances.iter().map(|i| i.name.as_str())) {
                if names.contains(&n) {
                    return Err(format!("{}: duplicate id `{}`", ctx, n));
                }
                names.push(n);
            }
            drop(names);

            let ty = &mut self.def.types[id];
            ty.seq = seq;
            ty.instances = instances;
        }
        Ok(())
    }

    fn field(&self, scope: TypeId, attr: &KsyAttr, id: String) -> Result<FieldDef, String> {
        let read = self.read_spec(scope, attr)?;
        let repeat = match attr.repeat.as_deref() {
            None => Repeat::None,
            Some("eos") => Repeat::Eos,
            Some("expr") => Repeat::Expr(self.expr(
                scope,
                attr.repeat_expr
                    .as_ref()
                    .ok_or("repeat: expr requires repeat-expr")?,
            )?),
            Some("until") => Repeat::Until(self.expr(
                scope,
                attr.repeat_until
                    .as_ref()
                    .ok_or("repeat: until requires repeat-until")?,
            )?),
            Some(other) => return Err(format!("unknown repeat kind `{}`", other)),
        };
        let condition = attr
            .condition
            .as_ref()
            .map(|c| self.expr(scope, c))
            .transpose()?;
        let enum_ref = match &attr.enum_name {
            Some(name) => {
                if !is_integer_read(&read) {
                    return Err(format!("enum `{}` applied to a non-integer type", name));
                }
                Some(self.enum_id(scope, name)?)
            }
            None => None,
        };
        let valid = attr
            .valid
            .as_ref()
            .map(|v| self.validation(scope, v))
            .transpose()?;
        let contents = attr
            .contents
            .as_ref()
            .map(ksy::literal_bytes)
            .transpose()?;
        Ok(FieldDef {
            id,
            read,
            repeat,
            condition,
            enum_ref,
            valid,
            contents,
            doc: attr.doc.clone(),
        })
    }

    fn instance(&self, scope: TypeId, name: &str, attr: &KsyAttr) -> Result<InstanceDef, String> {
        let kind = match &attr.value {
            Some(value) => InstanceKind::Value {
                expr: self.expr(scope, value)?,
                enum_ref: attr
                    .enum_name
                    .as_ref()
                    .map(|e| self.enum_id(scope, e))
                    .transpose()?,
                condition: attr
                    .condition
                    .as_ref()
                    .map(|c| self.expr(scope, c))
                    .transpose()?,
            },
            None => InstanceKind::Parse {
                pos: attr.pos.as_ref().map(|p| self.expr(scope, p)).transpose()?,
                io: attr.io.as_ref().map(|p| self.expr(scope, p)).transpose()?,
                field: self.field(scope, attr, name.to_string())?,
            },
        };
        Ok(InstanceDef {
            name: name.to_string(),
            kind,
            doc: attr.doc.clone(),
        })
    }

    fn read_spec(&self, scope: TypeId, attr: &KsyAttr) -> Result<ReadSpec, String> {
        if let Some(contents) = &attr.contents {
            let len = ksy::literal_bytes(contents)?.len();
            return Ok(ReadSpec::Bytes(BytesSpec {
                size: SizeSpec::Expr(Expr::Int(len as i128)),
                terminator: None,
                pad_right: None,
                process: None,
            }));
        }
        match &attr.ty {
            None => self
                .bytes_spec(scope, attr, false)?
                .map(ReadSpec::Bytes)
                .ok_or_else(|| "byte array needs size, size-eos or terminator".to_string()),
            Some(KsyTypeRef::Name(name)) => self.named(scope, name, attr),
            Some(KsyTypeRef::Switch(sw)) => {
                let on = self.expr(scope, &sw.switch_on)?;
                let mut cases = Vec::with_capacity(sw.cases.len());
                let mut default = None;
                for (key, type_name) in sw.cases.iter() {
                    let spec = self
                        .named(scope, type_name, attr)
                        .map_err(|e| format!("case {}: {}", ksy::expr_source(key).unwrap_or_default(), e))?;
                    if matches!(key, Yaml::String(s) if s == "_") {
                        default = Some(Box::new(spec));
                    } else {
                        cases.push((self.expr(scope, key)?, spec));
                    }
                }
                // Sized switches without a default fall back to raw bytes.
                if default.is_none() {
                    if let Some(bytes) = self.bytes_spec(scope, attr, false)? {
                        default = Some(Box::new(ReadSpec::Bytes(bytes)));
                    }
                }
                Ok(ReadSpec::Switch { on, cases, default })
            }
        }
    }

    fn named(&self, scope: TypeId, name: &str, attr: &KsyAttr) -> Result<ReadSpec, String> {
        let (base, args) = split_call(name)?;
        if let Some(spec) = self.builtin(scope, base, attr)? {
            if args.is_some() {
                return Err(format!("built-in type `{}` takes no arguments", base));
            }
            return Ok(spec);
        }
        let segs: Vec<&str> = base.split("::").collect();
        let type_id = self
            .def
            .resolve_type(scope, &segs)
            .ok_or_else(|| format!("unknown type `{}`", base))?;
        let args = match args {
            Some(list) => {
                let exprs = parse_expr_list(list).map_err(|e| e.to_string())?;
                for e in &exprs {
                    self.check_enum_refs(scope, e)?;
                }
                exprs
            }
            None => Vec::new(),
        };
        let declared = self.def.get_type(type_id).params.len();
        if args.len() > declared {
            return Err(format!(
                "type `{}` takes {} parameter(s), {} given",
                base,
                declared,
                args.len()
            ));
        }
        let bytes = self.bytes_spec(scope, attr, false)?;
        if bytes.as_ref().is_some_and(|b| b.process.is_some()) {
            return Err("process on user types is not supported".to_string());
        }
        Ok(ReadSpec::User {
            type_id,
            args,
            bytes,
        })
    }

    fn builtin(&self, scope: TypeId, name: &str, attr: &KsyAttr) -> Result<Option<ReadSpec>, String> {
        let ty = self.def.get_type(scope);
        if name == "str" || name == "strz" {
            let zero_terminated = name == "strz";
            let encoding = match &attr.encoding {
                Some(e) => Encoding::from_name(e).ok_or_else(|| format!("unknown encoding `{}`", e))?,
                None => ty
                    .encoding
                    .ok_or("string without encoding (set `encoding` or meta/encoding)")?,
            };
            let bytes = self
                .bytes_spec(scope, attr, zero_terminated)?
                .ok_or("str needs size, size-eos or terminator")?;
            return Ok(Some(ReadSpec::Str {
                bytes,
                encoding,
                zero_terminated,
            }));
        }
        let Some((kind, width, suffix)) = numeric_type(name) else {
            return Ok(None);
        };
        let byte_endian = || -> Result<Endianness, String> {
            suffix.or(ty.endian).ok_or_else(|| {
                format!("type `{}` needs an explicit endianness (no meta/endian)", name)
            })
        };
        Ok(Some(match (kind, width) {
            ('u' | 's', 1) => ReadSpec::Int {
                width: 1,
                signed: kind == 's',
                endian: Endianness::Big,
            },
            ('u' | 's', 2 | 4 | 8) => ReadSpec::Int {
                width: width as usize,
                signed: kind == 's',
                endian: byte_endian()?,
            },
            ('f', 4 | 8) => ReadSpec::Float {
                width: width as usize,
                endian: byte_endian()?,
            },
            ('b', 1..=64) => ReadSpec::BitInt {
                width,
                endian: suffix.unwrap_or(ty.bit_endian),
            },
            _ => return Ok(None),
        }))
    }

    fn bytes_spec(
        &self,
        scope: TypeId,
        attr: &KsyAttr,
        zero_terminated: bool,
    ) -> Result<Option<BytesSpec>, String> {
        let term_bytes = match (&attr.terminator, zero_terminated) {
            (Some(t), _) => Some(ksy::literal_bytes(t)?),
            (None, true) => Some(vec![0]),
            (None, false) => None,
        };
        if term_bytes.as_ref().is_some_and(|t| t.is_empty()) {
            return Err("empty terminator".to_string());
        }
        let terminator = term_bytes.map(|bytes| Terminator {
            bytes,
            include: attr.include.unwrap_or(false),
            consume: attr.consume.unwrap_or(true),
            eos_error: attr.eos_error.unwrap_or(true),
        });
        let size_eos = attr.size_eos.unwrap_or(false);
        let size = match &attr.size {
            Some(_) if size_eos => return Err("size and size-eos are mutually exclusive".to_string()),
            Some(s) => SizeSpec::Expr(self.expr(scope, s)?),
            None if size_eos => SizeSpec::Eos,
            None if terminator.is_some() => SizeSpec::Terminated,
            None => return Ok(None),
        };
        let process = attr
            .process
            .as_deref()
            .map(|p| self.process(scope, p))
            .transpose()?;
        Ok(Some(BytesSpec {
            size,
            terminator,
            pad_right: attr.pad_right,
            process,
        }))
    }

    fn process(&self, scope: TypeId, text: &str) -> Result<Process, String> {
        let (name, args) = split_call(text)?;
        let arg = || -> Result<Expr, String> {
            let list = args.ok_or_else(|| format!("process `{}` needs an argument", name))?;
            let mut exprs = parse_expr_list(list).map_err(|e| e.to_string())?;
            if exprs.len() != 1 {
                return Err(format!("process `{}` takes exactly one argument", name));
            }
            let e = exprs.remove(0);
            self.check_enum_refs(scope, &e)?;
            Ok(e)
        };
        match name {
            "xor" => Ok(Process::Xor(arg()?)),
            "rol" => Ok(Process::Rol(arg()?)),
            "ror" => Ok(Process::Ror(arg()?)),
            other => Err(format!("process `{}` is not supported", other)),
        }
    }

    fn validation(&self, scope: TypeId, v: &Yaml) -> Result<Validation, String> {
        let Yaml::Mapping(map) = v else {
            return Ok(Validation::Eq(self.expr(scope, v)?));
        };
        let mut min = None;
        let mut max = None;
        for (key, value) in map {
            match key.as_str() {
                Some("eq") => return Ok(Validation::Eq(self.expr(scope, value)?)),
                Some("any-of") => {
                    let Yaml::Sequence(items) = value else {
                        return Err("valid/any-of must be a list".to_string());
                    };
                    let exprs = items
                        .iter()
                        .map(|i| self.expr(scope, i))
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Validation::AnyOf(exprs));
                }
                Some("expr") => return Ok(Validation::Expr(self.expr(scope, value)?)),
                Some("min") => min = Some(self.expr(scope, value)?),
                Some("max") => max = Some(self.expr(scope, value)?),
                _ => return Err(format!("unknown valid key {:?}", key)),
            }
        }
        if min.is_none() && max.is_none() {
            return Err("empty valid".to_string());
        }
        Ok(Validation::Range { min, max })
    }

    fn enum_id(&self, scope: TypeId, name: &str) -> Result<usize, String> {
        let path: Vec<&str> = name.split("::").collect();
        self.def
            .resolve_enum(scope, &path)
            .ok_or_else(|| format!("unknown enum `{}`", name))
    }

    fn expr(&self, scope: TypeId, v: &Yaml) -> Result<Expr, String> {
        let src = ksy::expr_source(v)?;
        let e = parse_expr(&src).map_err(|e| e.to_string())?;
        self.check_enum_refs(scope, &e)?;
        Ok(e)
    }

    fn check_enum_refs(&self, scope: TypeId, e: &Expr) -> Result<(), String> {
        let mut bad = None;
        e.walk(&mut |node| {
            if let Expr::EnumRef { path, label } = node {
                let known = self
                    .def
                    .resolve_enum(scope, path)
                    .and_then(|id| self.def.get_enum(id).value_of(label))
                    .is_some();
                if !known && bad.is_none() {
                    bad = Some(format!("{}::{}", path.join("::"), label));
                }
            }
        });
        match bad {
            Some(r) => Err(format!("unknown enum value `{}`", r)),
            None => Ok(()),
        }
    }
}

fn param_def(p: &KsyParam) -> ParamDef {
    let ty = match p.ty.as_deref() {
        None => ParamType::Any,
        Some("bool") => ParamType::Bool,
        Some("str") => ParamType::Str,
        Some("bytes") => ParamType::Bytes,
        Some(t) => match numeric_type(t) {
            Some(('f', _, _)) => ParamType::Float,
            Some(_) => ParamType::Int,
            None => ParamType::Any,
        },
    };
    ParamDef {
        name: p.id.clone(),
        ty,
    }
}

/// `u4le` → `('u', 4, Some(Little))`, `b12` → `('b', 12, None)`.
fn numeric_type(name: &str) -> Option<(char, u32, Option<Endianness>)> {
    let mut chars = name.chars();
    let kind = chars.next().filter(|c| matches!(c, 'u' | 's' | 'f' | 'b'))?;
    let rest = chars.as_str();
    let digits_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let width: u32 = rest[..digits_end].parse().ok()?;
    let suffix = match &rest[digits_end..] {
        "" => None,
        "be" => Some(Endianness::Big),
        "le" => Some(Endianness::Little),
        _ => return None,
    };
    Some((kind, width, suffix))
}

fn is_integer_read(read: &ReadSpec) -> bool {
    match read {
        ReadSpec::Int { .. } | ReadSpec::BitInt { .. } => true,
        ReadSpec::Switch { cases, default, .. } => {
            cases.iter().all(|(_, r)| is_integer_read(r))
                && default.as_deref().map_or(true, is_integer_read)
        }
        _ => false,
    }
}

/// `name(args)` → `("name", Some("args"))`.
fn split_call(text: &str) -> Result<(&str, Option<&str>), String> {
    let text = text.trim();
    match text.find('(') {
        Some(open) => {
            let inner = text[open + 1..]
                .strip_suffix(')')
                .ok_or_else(|| format!("unbalanced parentheses in `{}`", text))?;
            Ok((text[..open].trim(), Some(inner)))
        }
        None => Ok((text, None)),
    }
}
