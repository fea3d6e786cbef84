//! Decoding engine: interprets a [`DecoderDefinition`] over a [`ByteSource`].
//!
//! `seq` fields are decoded eagerly, in declared order, because later fields depend on
//! earlier values (sizes, counts, switch keys, conditions). Each decoded user-type instance
//! becomes a [`StructObj`] in a flat arena; fields are [`FieldRecord`]s carrying the value,
//! the type name, and the absolute byte range consumed. Instances are evaluated on first
//! use, either by an expression during the decode or later through
//! [`DecodedTree::ensure_instance`].
//!
//! Any failure aborts the decode with a [`DecodeError`] naming the full field path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ast::{
    BytesSpec, DecoderDefinition, EnumId, FieldDef, InstanceDef, InstanceKind, Process,
    ReadSpec, Repeat, SizeSpec, TypeDef, TypeId, Validation,
};
use crate::expr::{BinOp, Expr, ExprError, ExprValue, IoRef};
use crate::stream::{hex_bytes, BinaryData, ByteSource, Endianness, IoWindow, StreamError};
use crate::value::{decode_str, Value};

/// Index of a decoded struct in [`DecodedTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjId(pub usize);

impl ObjId {
    pub const ROOT: ObjId = ObjId(0);
}

/// Cooperative cancellation, checked before every field and every array element.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    pub cancel: CancelToken,
    /// Root type arguments. Missing trailing arguments take the parameter's zero value.
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Expression(#[from] ExprError),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("bad length: {0}")]
    BadLength(String),
    #[error("decode cancelled")]
    Cancelled,
}

/// Decode failure with the dotted field path where it happened (`png.chunks[3].len`).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path}: {kind}")]
pub struct DecodeError {
    pub path: String,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind) -> Self {
        DecodeError {
            path: String::new(),
            kind,
        }
    }

    /// Prefix the path with an enclosing field name or `[index]`.
    pub fn within(mut self, segment: &str) -> Self {
        self.path = if self.path.is_empty() {
            segment.to_string()
        } else if self.path.starts_with('[') {
            format!("{}{}", segment, self.path)
        } else {
            format!("{}.{}", segment, self.path)
        };
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == DecodeErrorKind::Cancelled
    }
}

impl From<StreamError> for DecodeError {
    fn from(e: StreamError) -> Self {
        DecodeError::new(DecodeErrorKind::Stream(e))
    }
}

impl From<ExprError> for DecodeError {
    fn from(e: ExprError) -> Self {
        DecodeError::new(DecodeErrorKind::Expression(e))
    }
}

fn bad_length(msg: String) -> DecodeError {
    DecodeError::new(DecodeErrorKind::BadLength(msg))
}

fn mismatch(msg: String) -> DecodeError {
    DecodeError::new(DecodeErrorKind::TypeMismatch(msg))
}

/// One decoded user-type instance.
#[derive(Debug, Clone)]
pub struct StructObj {
    pub type_id: TypeId,
    pub parent: Option<ObjId>,
    /// Stream the struct was read from.
    pub io: IoWindow,
    pub params: Vec<ExprValue>,
    /// Decoded `seq` fields; skipped conditional fields have no record.
    pub fields: Vec<FieldRecord>,
    pub instances: Vec<InstanceSlot>,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceSlot {
    Pending,
    Evaluating,
    Done(FieldRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldRecord {
    pub name: String,
    pub type_name: String,
    pub data: FieldData,
    /// Absolute `[start, end)`; `None` for value instances.
    pub range: Option<(u64, u64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    Scalar(Value),
    Struct(ObjId),
    Array(Vec<FieldRecord>),
}

/// Where a record lives: a field or instance slot of an object, then array indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLoc {
    pub obj: ObjId,
    pub slot: Slot,
    pub items: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Field(usize),
    Instance(usize),
}

/// Result of a successful decode: the struct arena plus the definition it follows.
#[derive(Debug, Clone)]
pub struct DecodedTree {
    definition: Arc<DecoderDefinition>,
    objects: Vec<StructObj>,
    window: IoWindow,
}

impl DecodedTree {
    pub fn definition(&self) -> &Arc<DecoderDefinition> {
        &self.definition
    }

    pub fn root(&self) -> ObjId {
        ObjId::ROOT
    }

    /// Absolute range of the decoded buffer (window).
    pub fn range(&self) -> (u64, u64) {
        (self.window.base, self.window.base + self.window.len)
    }

    pub fn object(&self, id: ObjId) -> &StructObj {
        &self.objects[id.0]
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn type_of(&self, id: ObjId) -> &TypeDef {
        self.definition.get_type(self.objects[id.0].type_id)
    }

    /// Decoded `seq` field by name.
    pub fn field(&self, obj: ObjId, name: &str) -> Option<&FieldRecord> {
        self.objects[obj.0].fields.iter().find(|f| f.name == name)
    }

    /// Instance record if it has been evaluated.
    pub fn instance(&self, obj: ObjId, idx: usize) -> Option<&FieldRecord> {
        match self.objects[obj.0].instances.get(idx) {
            Some(InstanceSlot::Done(rec)) => Some(rec),
            _ => None,
        }
    }

    pub fn record(&self, loc: &RecordLoc) -> Option<&FieldRecord> {
        let obj = self.objects.get(loc.obj.0)?;
        let mut rec = match loc.slot {
            Slot::Field(i) => obj.fields.get(i)?,
            Slot::Instance(i) => match obj.instances.get(i)? {
                InstanceSlot::Done(rec) => rec,
                _ => return None,
            },
        };
        for &i in &loc.items {
            rec = match &rec.data {
                FieldData::Array(items) => items.get(i)?,
                _ => return None,
            };
        }
        Some(rec)
    }

    /// Evaluate instance `idx` of `obj` if needed. `data` must be the buffer that was decoded.
    pub fn ensure_instance(
        &mut self,
        data: &dyn BinaryData,
        obj: ObjId,
        idx: usize,
        cancel: &CancelToken,
    ) -> Result<&FieldRecord, DecodeError> {
        let count = self.objects.get(obj.0).map_or(0, |o| o.instances.len());
        if idx >= count {
            return Err(mismatch(format!("no instance #{} in object {}", idx, obj.0)));
        }
        let definition = Arc::clone(&self.definition);
        let mut engine = Engine {
            def: &definition,
            data,
            objects: std::mem::take(&mut self.objects),
            cancel: cancel.clone(),
        };
        let result = engine.ensure_instance(obj, idx);
        self.objects = engine.objects;
        result?;
        self.instance(obj, idx)
            .ok_or_else(|| mismatch(format!("instance #{} was not evaluated", idx)))
    }

    /// Evaluate an instance by name.
    pub fn instance_by_name(
        &mut self,
        data: &dyn BinaryData,
        obj: ObjId,
        name: &str,
    ) -> Result<&FieldRecord, DecodeError> {
        let idx = self
            .type_of(obj)
            .instance_index(name)
            .ok_or_else(|| DecodeError::from(ExprError::UnknownName(name.to_string())))?;
        self.ensure_instance(data, obj, idx, &CancelToken::new())
    }
}

/// Decode `source` according to `definition`.
pub fn decode(
    definition: &Arc<DecoderDefinition>,
    source: ByteSource<'_>,
    options: &DecodeOptions,
) -> Result<DecodedTree, DecodeError> {
    let def: &DecoderDefinition = definition;
    let mut source = source;
    let window = source.window();
    let mut engine = Engine {
        def,
        data: source.data(),
        objects: Vec::new(),
        cancel: options.cancel.clone(),
    };
    let params = engine.arguments(DecoderDefinition::ROOT, options.arguments.iter().map(ExprValue::from).collect());
    log::debug!("decoding {} over {} byte(s) at {:#x}", def.id, window.len, window.base);
    engine
        .read_struct(DecoderDefinition::ROOT, None, &mut source, params)
        .map_err(|e| e.within(&def.id))?;
    log::debug!("decoded {}: {} struct(s)", def.id, engine.objects.len());
    Ok(DecodedTree {
        definition: Arc::clone(definition),
        objects: engine.objects,
        window,
    })
}

/// Expression evaluation context.
#[derive(Clone, Copy)]
struct Ctx<'v> {
    obj: ObjId,
    io: IoRef,
    /// `_`: current repeat item or value under validation.
    item: Option<&'v ExprValue>,
    index: Option<usize>,
}

impl Ctx<'_> {
    fn at(obj: ObjId, io: &ByteSource<'_>) -> Ctx<'static> {
        let w = io.window();
        Ctx {
            obj,
            io: IoRef {
                base: w.base,
                len: w.len,
                pos: io.position(),
            },
            item: None,
            index: None,
        }
    }
}

struct Engine<'a> {
    def: &'a DecoderDefinition,
    data: &'a dyn BinaryData,
    objects: Vec<StructObj>,
    cancel: CancelToken,
}

impl<'a> Engine<'a> {
    fn check_cancel(&self) -> Result<(), DecodeError> {
        if self.cancel.is_cancelled() {
            return Err(DecodeError::new(DecodeErrorKind::Cancelled));
        }
        Ok(())
    }

    /// Supplied arguments padded with zero values for undeclared trailing parameters.
    fn arguments(&self, type_id: TypeId, mut args: Vec<ExprValue>) -> Vec<ExprValue> {
        for p in self.def.get_type(type_id).params.iter().skip(args.len()) {
            args.push(ExprValue::from(&p.ty.zero_value()));
        }
        args
    }

    fn read_struct(
        &mut self,
        type_id: TypeId,
        parent: Option<ObjId>,
        io: &mut ByteSource<'a>,
        params: Vec<ExprValue>,
    ) -> Result<ObjId, DecodeError> {
        let def = self.def;
        let ty = def.get_type(type_id);
        let id = ObjId(self.objects.len());
        let start = io.absolute_position();
        log::trace!("struct {} at {:#x}", ty.name, start);
        self.objects.push(StructObj {
            type_id,
            parent,
            io: io.window(),
            params,
            fields: Vec::with_capacity(ty.seq.len()),
            instances: vec![InstanceSlot::Pending; ty.instances.len()],
            start,
            end: start,
        });
        for field in &ty.seq {
            self.check_cancel().map_err(|e| e.within(&field.id))?;
            let rec = self
                .read_field(id, field, io)
                .map_err(|e| e.within(&field.id))?;
            let obj = &mut self.objects[id.0];
            if let Some(rec) = rec {
                obj.fields.push(rec);
            }
            obj.end = io.absolute_position();
        }
        Ok(id)
    }

    fn read_field(
        &mut self,
        obj: ObjId,
        field: &'a FieldDef,
        io: &mut ByteSource<'a>,
    ) -> Result<Option<FieldRecord>, DecodeError> {
        if let Some(cond) = &field.condition {
            if !self.eval(cond, Ctx::at(obj, io))?.to_bool()? {
                log::trace!("{}: condition false, skipped", field.id);
                return Ok(None);
            }
        }
        let start = io.absolute_position();
        let mut items = Vec::new();
        match &field.repeat {
            Repeat::None => return self.read_item(obj, field, io, None).map(Some),
            Repeat::Expr(count) => {
                let n = self.eval(count, Ctx::at(obj, io))?.to_int()?;
                let n = usize::try_from(n)
                    .map_err(|_| bad_length(format!("repeat count {} is negative", n)))?;
                items.reserve(n.min(1 << 16));
                for i in 0..n {
                    items.push(self.read_element(obj, field, io, i)?);
                }
            }
            Repeat::Eos => {
                let mut i = 0;
                while !io.is_at_end() {
                    let before = (io.position(), io.bits_left());
                    items.push(self.read_element(obj, field, io, i)?);
                    if (io.position(), io.bits_left()) == before && !io.is_at_end() {
                        return Err(bad_length(format!(
                            "repeat until end of stream: item [{}] consumed no bytes",
                            i
                        )));
                    }
                    i += 1;
                }
            }
            Repeat::Until(cond) => {
                let mut i = 0;
                loop {
                    let item = self.read_element(obj, field, io, i)?;
                    let value = record_value(&item);
                    let ctx = Ctx {
                        item: Some(&value),
                        index: Some(i),
                        ..Ctx::at(obj, io)
                    };
                    let done = self
                        .eval(cond, ctx)
                        .and_then(|v| Ok(v.to_bool()?))
                        .map_err(|e| e.within(&format!("[{}]", i)))?;
                    items.push(item);
                    if done {
                        break;
                    }
                    i += 1;
                }
            }
        }
        let item_type = match items.first() {
            Some(first) => first.type_name.clone(),
            None => field.read.type_name(self.def),
        };
        Ok(Some(FieldRecord {
            name: field.id.clone(),
            type_name: format!("{}[]", item_type),
            data: FieldData::Array(items),
            range: Some((start, io.absolute_position())),
        }))
    }

    fn read_element(
        &mut self,
        obj: ObjId,
        field: &'a FieldDef,
        io: &mut ByteSource<'a>,
        i: usize,
    ) -> Result<FieldRecord, DecodeError> {
        self.check_cancel()
            .and_then(|_| self.read_item(obj, field, io, Some(i)))
            .map_err(|e| e.within(&format!("[{}]", i)))
    }

    /// One value of a field: read, then enum mapping, `contents` and `valid` checks.
    fn read_item(
        &mut self,
        obj: ObjId,
        field: &'a FieldDef,
        io: &mut ByteSource<'a>,
        index: Option<usize>,
    ) -> Result<FieldRecord, DecodeError> {
        let start = io.absolute_position();
        let (mut data, type_name) = self.read_spec(obj, &field.read, io, index)?;
        if let FieldData::Scalar(v) = &mut data {
            if let Some(expected) = &field.contents {
                if v.as_bytes() != Some(expected.as_slice()) {
                    return Err(DecodeError::new(DecodeErrorKind::Validation(format!(
                        "expected contents {}, got {}",
                        hex_bytes(expected),
                        v.as_bytes().map(hex_bytes).unwrap_or_default()
                    ))));
                }
            }
            if let Some(enum_id) = field.enum_ref {
                let raw = match &*v {
                    Value::Bool(b) => *b as i128,
                    other => other
                        .as_int()
                        .ok_or_else(|| mismatch(format!("enum over non-integer {:?}", other)))?,
                };
                *v = self.enum_value(enum_id, raw);
            }
            if let Some(valid) = &field.valid {
                let current = ExprValue::from(&*v);
                self.validate(obj, io, valid, &current, index)?;
            }
        }
        Ok(FieldRecord {
            name: match index {
                Some(i) => format!("[{}]", i),
                None => field.id.clone(),
            },
            type_name,
            data,
            range: Some((start, io.absolute_position())),
        })
    }

    fn read_spec(
        &mut self,
        obj: ObjId,
        spec: &'a ReadSpec,
        io: &mut ByteSource<'a>,
        index: Option<usize>,
    ) -> Result<(FieldData, String), DecodeError> {
        let def = self.def;
        let value = match spec {
            ReadSpec::Int {
                width,
                signed: true,
                endian,
            } => Value::signed(*width, io.read_signed(*width, *endian)?),
            ReadSpec::Int { width, endian, .. } => {
                Value::unsigned(*width, io.read_unsigned(*width, *endian)?)
            }
            ReadSpec::Float { width: 4, endian } => Value::Float(io.read_f32(*endian)?),
            ReadSpec::Float { width, endian } => Value::Double(io.read_float(*width, *endian)?),
            ReadSpec::BitInt { width, endian } => {
                let raw = match endian {
                    Endianness::Big => io.read_bits_int_be(*width)?,
                    Endianness::Little => io.read_bits_int_le(*width)?,
                };
                match *width {
                    1 => Value::Bool(raw != 0),
                    2..=8 => Value::U8(raw as u8),
                    9..=16 => Value::U16(raw as u16),
                    17..=32 => Value::U32(raw as u32),
                    _ => Value::U64(raw),
                }
            }
            ReadSpec::Bytes(bytes) => Value::Bytes(self.read_bytes_spec(obj, bytes, io, index)?),
            ReadSpec::Str {
                bytes, encoding, ..
            } => {
                let raw = self.read_bytes_spec(obj, bytes, io, index)?;
                Value::Str(decode_str(&raw, *encoding))
            }
            ReadSpec::User {
                type_id,
                args,
                bytes,
            } => {
                let ctx = Ctx {
                    index,
                    ..Ctx::at(obj, io)
                };
                let values = args
                    .iter()
                    .map(|a| self.eval(a, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                let params = self.arguments(*type_id, values);
                let child = match bytes {
                    Some(b) => {
                        let mut sub = self.sized_window(obj, b, io, index)?;
                        self.read_struct(*type_id, Some(obj), &mut sub, params)?
                    }
                    None => self.read_struct(*type_id, Some(obj), io, params)?,
                };
                return Ok((FieldData::Struct(child), def.get_type(*type_id).name.clone()));
            }
            ReadSpec::Switch { on, cases, default } => {
                let ctx = Ctx {
                    index,
                    ..Ctx::at(obj, io)
                };
                let key = self.eval(on, ctx)?;
                let mut chosen = None;
                for (case, case_spec) in cases {
                    if self.eval(case, ctx)?.loose_eq(&key) {
                        chosen = Some(case_spec);
                        break;
                    }
                }
                return match chosen.or(default.as_deref()) {
                    Some(case_spec) => self.read_spec(obj, case_spec, io, index),
                    None => Ok((FieldData::Scalar(Value::Null), spec.type_name(def))),
                };
            }
        };
        Ok((FieldData::Scalar(value), spec.type_name(def)))
    }

    /// Substream holding a sized/terminated field's content. The parent cursor moves past
    /// everything the field occupies (padding and consumed terminator included).
    fn sized_window(
        &mut self,
        obj: ObjId,
        spec: &'a BytesSpec,
        io: &mut ByteSource<'a>,
        index: Option<usize>,
    ) -> Result<ByteSource<'a>, DecodeError> {
        let mut win = match &spec.size {
            SizeSpec::Expr(e) => {
                let ctx = Ctx {
                    index,
                    ..Ctx::at(obj, io)
                };
                let n = self.eval(e, ctx)?.to_int()?;
                let n = u64::try_from(n).map_err(|_| bad_length(format!("size {} is negative", n)))?;
                io.substream(n)?
            }
            SizeSpec::Eos => {
                io.align_to_byte();
                let rest = io.size() - io.position();
                io.substream(rest)?
            }
            SizeSpec::Terminated => {
                let t = spec
                    .terminator
                    .as_ref()
                    .ok_or_else(|| bad_length("terminated read without terminator".to_string()))?;
                io.align_to_byte();
                let start = io.position();
                let content = io.read_until(&t.bytes, t.include, t.consume, t.eos_error)?;
                return Ok(io.slice(start, content.len() as u64)?);
            }
        };
        if spec.pad_right.is_some() || spec.terminator.is_some() {
            let bytes = win.clone().read_remaining()?;
            let mut len = bytes.len();
            if let Some(pad) = spec.pad_right {
                while len > 0 && bytes[len - 1] == pad {
                    len -= 1;
                }
            }
            if let Some(t) = spec.terminator.as_ref().filter(|t| !t.bytes.is_empty()) {
                let unit = t.bytes.len();
                if let Some(at) = bytes[..len].chunks(unit).position(|c| c == t.bytes.as_slice()) {
                    len = at * unit + if t.include { unit } else { 0 };
                }
            }
            win = win.slice(0, len as u64)?;
        }
        Ok(win)
    }

    fn read_bytes_spec(
        &mut self,
        obj: ObjId,
        spec: &'a BytesSpec,
        io: &mut ByteSource<'a>,
        index: Option<usize>,
    ) -> Result<Vec<u8>, DecodeError> {
        let mut win = self.sized_window(obj, spec, io, index)?;
        let mut raw = win.read_remaining()?;
        if let Some(process) = &spec.process {
            self.apply_process(obj, io, process, &mut raw, index)?;
        }
        Ok(raw)
    }

    fn apply_process(
        &mut self,
        obj: ObjId,
        io: &ByteSource<'a>,
        process: &'a Process,
        raw: &mut [u8],
        index: Option<usize>,
    ) -> Result<(), DecodeError> {
        let ctx = Ctx {
            index,
            ..Ctx::at(obj, io)
        };
        match process {
            Process::Xor(key) => match self.eval(key, ctx)? {
                ExprValue::Bytes(k) if !k.is_empty() => {
                    for (b, k) in raw.iter_mut().zip(k.iter().cycle()) {
                        *b ^= k;
                    }
                }
                other => {
                    let k = other.to_int()? as u8;
                    raw.iter_mut().for_each(|b| *b ^= k);
                }
            },
            Process::Rol(n) | Process::Ror(n) => {
                let n = self.eval(n, ctx)?.to_int()?.rem_euclid(8) as u32;
                let left = matches!(process, Process::Rol(_));
                for b in raw.iter_mut() {
                    *b = if left { b.rotate_left(n) } else { b.rotate_right(n) };
                }
            }
        }
        Ok(())
    }

    fn validate(
        &mut self,
        obj: ObjId,
        io: &ByteSource<'a>,
        valid: &'a Validation,
        current: &ExprValue,
        index: Option<usize>,
    ) -> Result<(), DecodeError> {
        let ctx = Ctx {
            item: Some(current),
            index,
            ..Ctx::at(obj, io)
        };
        let fail = |msg: String| Err(DecodeError::new(DecodeErrorKind::Validation(msg)));
        match valid {
            Validation::Eq(e) => {
                let expected = self.eval(e, ctx)?;
                if !current.loose_eq(&expected) {
                    return fail(format!("expected {}, got {}", show(&expected), show(current)));
                }
            }
            Validation::AnyOf(options) => {
                let mut allowed = Vec::with_capacity(options.len());
                for o in options {
                    allowed.push(self.eval(o, ctx)?);
                }
                if !allowed.iter().any(|a| current.loose_eq(a)) {
                    return fail(format!("{} is not one of the allowed values", show(current)));
                }
            }
            Validation::Range { min, max } => {
                if let Some(min) = min {
                    let min = self.eval(min, ctx)?;
                    if ExprValue::binary(BinOp::Lt, current.clone(), min.clone())?.to_bool()? {
                        return fail(format!("{} is less than minimum {}", show(current), show(&min)));
                    }
                }
                if let Some(max) = max {
                    let max = self.eval(max, ctx)?;
                    if ExprValue::binary(BinOp::Gt, current.clone(), max.clone())?.to_bool()? {
                        return fail(format!("{} is greater than maximum {}", show(current), show(&max)));
                    }
                }
            }
            Validation::Expr(e) => {
                if !self.eval(e, ctx)?.to_bool()? {
                    return fail(format!("{} does not satisfy the validation expression", show(current)));
                }
            }
        }
        Ok(())
    }

    fn enum_value(&self, enum_id: EnumId, value: i128) -> Value {
        let e = self.def.get_enum(enum_id);
        Value::Enum {
            enum_id,
            name: e.name.clone(),
            value,
            label: e.label(value).map(str::to_string),
        }
    }

    fn io_of(&self, obj: ObjId) -> IoRef {
        let o = &self.objects[obj.0];
        IoRef {
            base: o.io.base,
            len: o.io.len,
            pos: o.end.saturating_sub(o.io.base).min(o.io.len),
        }
    }

    fn eval(&mut self, e: &Expr, ctx: Ctx<'_>) -> Result<ExprValue, DecodeError> {
        Ok(match e {
            Expr::Int(v) => ExprValue::Int(*v),
            Expr::Float(v) => ExprValue::Float(*v),
            Expr::Str(s) => ExprValue::Str(s.clone()),
            Expr::Bool(b) => ExprValue::Bool(*b),
            Expr::Name(n) => self.lookup(n, ctx)?,
            Expr::EnumRef { path, label } => {
                let scope = self.objects[ctx.obj.0].type_id;
                let full = || format!("{}::{}", path.join("::"), label);
                let enum_id = self
                    .def
                    .resolve_enum(scope, path.as_slice())
                    .ok_or_else(|| ExprError::UnknownEnum(full()))?;
                let value = self
                    .def
                    .get_enum(enum_id)
                    .value_of(label)
                    .ok_or_else(|| ExprError::UnknownEnum(full()))?;
                ExprValue::Enum { enum_id, value }
            }
            Expr::Unary(op, inner) => ExprValue::unary(*op, self.eval(inner, ctx)?)?,
            Expr::Binary(BinOp::And, l, r) => {
                ExprValue::Bool(self.eval(l, ctx)?.to_bool()? && self.eval(r, ctx)?.to_bool()?)
            }
            Expr::Binary(BinOp::Or, l, r) => {
                ExprValue::Bool(self.eval(l, ctx)?.to_bool()? || self.eval(r, ctx)?.to_bool()?)
            }
            Expr::Binary(op, l, r) => {
                let lv = self.eval(l, ctx)?;
                let rv = self.eval(r, ctx)?;
                ExprValue::binary(*op, lv, rv)?
            }
            Expr::Ternary(c, a, b) => {
                if self.eval(c, ctx)?.to_bool()? {
                    self.eval(a, ctx)?
                } else {
                    self.eval(b, ctx)?
                }
            }
            Expr::Member(recv, name) => match self.eval(recv, ctx)? {
                ExprValue::Struct(id) => self.member_of(id, name)?,
                other => other.property(name)?,
            },
            Expr::Call(recv, name, args) => {
                let target = self.eval(recv, ctx)?;
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(self.eval(a, ctx)?);
                }
                target.method(name, &values)?
            }
            Expr::Index(recv, idx) => {
                let target = self.eval(recv, ctx)?;
                let i = self.eval(idx, ctx)?;
                target.index(&i)?
            }
            Expr::Cast(inner, _) => self.eval(inner, ctx)?,
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for i in items {
                    values.push(self.eval(i, ctx)?);
                }
                ExprValue::Array(values)
            }
        })
    }

    fn lookup(&mut self, name: &str, ctx: Ctx<'_>) -> Result<ExprValue, DecodeError> {
        match name {
            "_io" => Ok(ExprValue::Io(ctx.io)),
            "_index" => ctx
                .index
                .map(|i| ExprValue::Int(i as i128))
                .ok_or_else(|| ExprError::UnknownName(name.to_string()).into()),
            "_" => ctx
                .item
                .cloned()
                .ok_or_else(|| ExprError::UnknownName(name.to_string()).into()),
            _ => self.member_of(ctx.obj, name),
        }
    }

    /// Name lookup inside a struct: fields, then parameters, then instances (evaluated on
    /// demand). A `seq` field that was skipped or not read yet evaluates to null.
    fn member_of(&mut self, obj: ObjId, name: &str) -> Result<ExprValue, DecodeError> {
        let def = self.def;
        let o = &self.objects[obj.0];
        match name {
            "_root" => return Ok(ExprValue::Struct(ObjId::ROOT)),
            "_parent" => return Ok(o.parent.map(ExprValue::Struct).unwrap_or(ExprValue::Null)),
            "_io" => return Ok(ExprValue::Io(self.io_of(obj))),
            _ => {}
        }
        if let Some(rec) = o.fields.iter().find(|f| f.name == name) {
            return Ok(record_value(rec));
        }
        let ty = def.get_type(o.type_id);
        if let Some(i) = ty.param_index(name) {
            return Ok(o.params.get(i).cloned().unwrap_or(ExprValue::Null));
        }
        if let Some(i) = ty.instance_index(name) {
            self.ensure_instance(obj, i)?;
            return Ok(match &self.objects[obj.0].instances[i] {
                InstanceSlot::Done(rec) => record_value(rec),
                _ => ExprValue::Null,
            });
        }
        if ty.field_index(name).is_some() {
            return Ok(ExprValue::Null);
        }
        Err(ExprError::UnknownName(name.to_string()).into())
    }

    fn ensure_instance(&mut self, obj: ObjId, idx: usize) -> Result<(), DecodeError> {
        let def = self.def;
        let inst = &def.get_type(self.objects[obj.0].type_id).instances[idx];
        match self.objects[obj.0].instances[idx] {
            InstanceSlot::Done(_) => return Ok(()),
            InstanceSlot::Evaluating => {
                return Err(ExprError::Cycle(inst.name.clone()).into())
            }
            InstanceSlot::Pending => {}
        }
        self.objects[obj.0].instances[idx] = InstanceSlot::Evaluating;
        log::trace!("evaluating instance {}", inst.name);
        let result = self.evaluate_instance(obj, inst);
        let slot = &mut self.objects[obj.0].instances[idx];
        match result {
            Ok(rec) => {
                *slot = InstanceSlot::Done(rec);
                Ok(())
            }
            Err(e) => {
                *slot = InstanceSlot::Pending;
                Err(e.within(&inst.name))
            }
        }
    }

    fn evaluate_instance(
        &mut self,
        obj: ObjId,
        inst: &'a InstanceDef,
    ) -> Result<FieldRecord, DecodeError> {
        let io_ref = self.io_of(obj);
        let ctx = Ctx {
            obj,
            io: io_ref,
            item: None,
            index: None,
        };
        let null = || FieldRecord {
            name: inst.name.clone(),
            type_name: "null".to_string(),
            data: FieldData::Scalar(Value::Null),
            range: None,
        };
        match &inst.kind {
            InstanceKind::Value {
                expr,
                enum_ref,
                condition,
            } => {
                if let Some(c) = condition {
                    if !self.eval(c, ctx)?.to_bool()? {
                        return Ok(null());
                    }
                }
                let v = self.eval(expr, ctx)?;
                let data = self.value_data(v, *enum_ref)?;
                Ok(FieldRecord {
                    name: inst.name.clone(),
                    type_name: self.data_type_name(&data),
                    data,
                    range: None,
                })
            }
            InstanceKind::Parse { pos, io, field } => {
                let window = match io {
                    Some(e) => match self.eval(e, ctx)? {
                        ExprValue::Io(r) => IoWindow {
                            base: r.base,
                            len: r.len,
                        },
                        other => {
                            return Err(mismatch(format!(
                                "io must be a stream, got {}",
                                other.kind_name()
                            )))
                        }
                    },
                    None => self.objects[obj.0].io,
                };
                let mut stream = ByteSource::with_window(self.data, window)?;
                let at = match pos {
                    Some(p) => {
                        let p = self.eval(p, ctx)?.to_int()?;
                        u64::try_from(p)
                            .map_err(|_| bad_length(format!("position {} is negative", p)))?
                    }
                    None if io.is_some() => 0,
                    None => io_ref.pos,
                };
                stream.seek(at)?;
                Ok(self.read_field(obj, field, &mut stream)?.unwrap_or_else(null))
            }
        }
    }

    fn value_data(&self, v: ExprValue, enum_ref: Option<EnumId>) -> Result<FieldData, DecodeError> {
        if let Some(enum_id) = enum_ref {
            return Ok(FieldData::Scalar(self.enum_value(enum_id, v.to_int()?)));
        }
        Ok(match v {
            ExprValue::Struct(id) => FieldData::Struct(id),
            ExprValue::Array(items) => {
                let mut records = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    let data = self.value_data(item, None)?;
                    records.push(FieldRecord {
                        name: format!("[{}]", i),
                        type_name: self.data_type_name(&data),
                        data,
                        range: None,
                    });
                }
                FieldData::Array(records)
            }
            ExprValue::Int(n) => FieldData::Scalar(
                i64::try_from(n)
                    .map(Value::I64)
                    .or_else(|_| u64::try_from(n).map(Value::U64))
                    .map_err(|_| ExprError::Overflow("value instance"))?,
            ),
            ExprValue::Float(f) => FieldData::Scalar(Value::Double(f)),
            ExprValue::Bool(b) => FieldData::Scalar(Value::Bool(b)),
            ExprValue::Str(s) => FieldData::Scalar(Value::Str(s)),
            ExprValue::Bytes(b) => FieldData::Scalar(Value::Bytes(b)),
            ExprValue::Enum { enum_id, value } => FieldData::Scalar(self.enum_value(enum_id, value)),
            ExprValue::Io(_) | ExprValue::Null => FieldData::Scalar(Value::Null),
        })
    }

    fn data_type_name(&self, data: &FieldData) -> String {
        match data {
            FieldData::Struct(id) => self.def.get_type(self.objects[id.0].type_id).name.clone(),
            FieldData::Array(_) => "array".to_string(),
            FieldData::Scalar(v) => match v {
                Value::Bool(_) => "bool",
                Value::Float(_) | Value::Double(_) => "float",
                Value::Bytes(_) => "bytes",
                Value::Str(_) => "str",
                Value::Enum { name, .. } => return name.clone(),
                Value::Null => "null",
                _ => "int",
            }
            .to_string(),
        }
    }
}

fn record_value(rec: &FieldRecord) -> ExprValue {
    match &rec.data {
        FieldData::Scalar(v) => ExprValue::from(v),
        FieldData::Struct(id) => ExprValue::Struct(*id),
        FieldData::Array(items) => ExprValue::Array(items.iter().map(record_value).collect()),
    }
}

fn show(v: &ExprValue) -> String {
    match v {
        ExprValue::Int(n) => n.to_string(),
        ExprValue::Float(f) => f.to_string(),
        ExprValue::Bool(b) => b.to_string(),
        ExprValue::Str(s) => format!("{:?}", s),
        ExprValue::Bytes(b) => hex_bytes(b),
        ExprValue::Enum { value, .. } => value.to_string(),
        ExprValue::Array(items) => {
            format!("[{}]", items.iter().map(show).collect::<Vec<_>>().join(", "))
        }
        other => other.kind_name().to_string(),
    }
}
