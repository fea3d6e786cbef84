//! Expression language of schema attributes: parser (pest) and value operations.
//!
//! Expressions are parsed once, when a schema is compiled, into [`Expr`] trees. Evaluation
//! needs access to decoded objects and lives in the engine; the context-free parts
//! (arithmetic, comparison, built-in properties and methods) are here on [`ExprValue`].

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;

use crate::ast::EnumId;
use crate::engine::ObjId;
use crate::value::{decode_str, Encoding, Value};

#[derive(Parser)]
#[grammar = "expr.pest"]
struct ExprParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    BitNot,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Mul,
    Div,
    Mod,
    Add,
    Sub,
    Shl,
    Shr,
    BitAnd,
    BitXor,
    BitOr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i128),
    Float(f64),
    Str(String),
    Bool(bool),
    /// Bare identifier: field, parameter, instance, or one of `_root`, `_parent`, `_io`,
    /// `_index`, `_`.
    Name(String),
    /// `enum_name::label`, possibly qualified with type scopes (`a::b::label`).
    EnumRef { path: Vec<String>, label: String },
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Member(Box<Expr>, String),
    Call(Box<Expr>, String, Vec<Expr>),
    Index(Box<Expr>, Box<Expr>),
    Cast(Box<Expr>, String),
    Array(Vec<Expr>),
}

impl Expr {
    /// Pre-order traversal.
    pub fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::Unary(_, e) | Expr::Member(e, _) | Expr::Cast(e, _) => e.walk(f),
            Expr::Binary(_, l, r) | Expr::Index(l, r) => {
                l.walk(f);
                r.walk(f);
            }
            Expr::Ternary(c, a, b) => {
                c.walk(f);
                a.walk(f);
                b.walk(f);
            }
            Expr::Call(recv, _, args) => {
                recv.walk(f);
                for a in args {
                    a.walk(f);
                }
            }
            Expr::Array(items) => {
                for i in items {
                    i.walk(f);
                }
            }
            _ => {}
        }
    }

    /// True when the expression mentions `name` as a bare identifier.
    pub fn mentions(&self, name: &str) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if let Expr::Name(n) = e {
                if n == name {
                    found = true;
                }
            }
        });
        found
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("cannot parse expression `{text}`: {message}")]
    Syntax { text: String, message: String },
    #[error("unknown name `{0}`")]
    UnknownName(String),
    #[error("unknown enum label `{0}`")]
    UnknownEnum(String),
    #[error("{0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in `{0}`")]
    Overflow(&'static str),
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i128, len: usize },
    #[error("instance `{0}` depends on itself")]
    Cycle(String),
}

fn syntax(text: &str, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        text: text.to_string(),
        message: message.into(),
    }
}

/// Parse a single expression.
pub fn parse_expr(text: &str) -> Result<Expr, ExprError> {
    let mut pairs =
        ExprParser::parse(Rule::expression, text).map_err(|e| syntax(text, e.to_string()))?;
    let top = pairs.next().ok_or_else(|| syntax(text, "empty input"))?;
    let inner = top
        .into_inner()
        .find(|p| p.as_rule() == Rule::expr)
        .ok_or_else(|| syntax(text, "empty expression"))?;
    build(inner).map_err(|m| syntax(text, m))
}

/// Parse a comma-separated expression list (type arguments).
pub fn parse_expr_list(text: &str) -> Result<Vec<Expr>, ExprError> {
    let mut pairs =
        ExprParser::parse(Rule::expr_list, text).map_err(|e| syntax(text, e.to_string()))?;
    let top = pairs.next().ok_or_else(|| syntax(text, "empty input"))?;
    top.into_inner()
        .filter(|p| p.as_rule() == Rule::expr)
        .map(|p| build(p).map_err(|m| syntax(text, m)))
        .collect()
}

fn binop(s: &str) -> Result<BinOp, String> {
    Ok(match s {
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Mod,
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "<<" => BinOp::Shl,
        ">>" => BinOp::Shr,
        "&" => BinOp::BitAnd,
        "^" => BinOp::BitXor,
        "|" => BinOp::BitOr,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "and" => BinOp::And,
        "or" => BinOp::Or,
        other => return Err(format!("unknown operator {}", other)),
    })
}

fn build(pair: Pair<Rule>) -> Result<Expr, String> {
    match pair.as_rule() {
        Rule::expr => build(pair.into_inner().next().ok_or("empty expression")?),
        Rule::ternary => {
            let mut it = pair.into_inner();
            let cond = build(it.next().ok_or("ternary: missing condition")?)?;
            match (it.next(), it.next()) {
                (Some(a), Some(b)) => Ok(Expr::Ternary(
                    Box::new(cond),
                    Box::new(build(a)?),
                    Box::new(build(b)?),
                )),
                _ => Ok(cond),
            }
        }
        Rule::or_expr
        | Rule::and_expr
        | Rule::cmp_expr
        | Rule::bitor_expr
        | Rule::bitxor_expr
        | Rule::bitand_expr
        | Rule::shift_expr
        | Rule::add_expr
        | Rule::mul_expr => {
            let mut it = pair.into_inner();
            let mut lhs = build(it.next().ok_or("missing operand")?)?;
            while let Some(op) = it.next() {
                let op = binop(op.as_str())?;
                let rhs = build(it.next().ok_or("missing right operand")?)?;
                lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
            }
            Ok(lhs)
        }
        Rule::not_expr | Rule::unary_expr => {
            let mut ops = Vec::new();
            let mut operand = None;
            for p in pair.into_inner() {
                match p.as_rule() {
                    Rule::not_op => ops.push(UnaryOp::Not),
                    Rule::unary_op => ops.push(if p.as_str() == "-" {
                        UnaryOp::Neg
                    } else {
                        UnaryOp::BitNot
                    }),
                    _ => operand = Some(build(p)?),
                }
            }
            let mut e = operand.ok_or("missing operand")?;
            for op in ops.into_iter().rev() {
                e = fold_unary(op, e);
            }
            Ok(e)
        }
        Rule::postfix_expr => {
            let mut it = pair.into_inner();
            let mut e = build(it.next().ok_or("missing primary")?)?;
            for post in it {
                let p = post.into_inner().next().ok_or("empty postfix")?;
                e = match p.as_rule() {
                    Rule::cast => {
                        let ty = p.into_inner().next().ok_or("cast: missing type")?;
                        Expr::Cast(Box::new(e), ty.as_str().to_string())
                    }
                    Rule::call => {
                        let mut parts = p.into_inner();
                        let name = parts.next().ok_or("call: missing name")?.as_str().to_string();
                        let args = parts.map(build).collect::<Result<Vec<_>, _>>()?;
                        Expr::Call(Box::new(e), name, args)
                    }
                    Rule::member => {
                        let name = p.into_inner().next().ok_or("member: missing name")?;
                        Expr::Member(Box::new(e), name.as_str().to_string())
                    }
                    Rule::index => {
                        let idx = p.into_inner().next().ok_or("index: missing expression")?;
                        Expr::Index(Box::new(e), Box::new(build(idx)?))
                    }
                    other => return Err(format!("unexpected postfix {:?}", other)),
                };
            }
            Ok(e)
        }
        Rule::primary => build(pair.into_inner().next().ok_or("empty primary")?),
        Rule::array_lit => Ok(Expr::Array(
            pair.into_inner().map(build).collect::<Result<Vec<_>, _>>()?,
        )),
        Rule::integer => parse_int(pair.as_str()).map(Expr::Int),
        Rule::float => pair
            .as_str()
            .parse::<f64>()
            .map(Expr::Float)
            .map_err(|e| e.to_string()),
        Rule::boolean => Ok(Expr::Bool(pair.as_str() == "true")),
        Rule::string => {
            let inner = pair.into_inner().next().ok_or("string: missing body")?;
            match inner.as_rule() {
                Rule::dq_inner => unescape(inner.as_str()).map(Expr::Str),
                _ => Ok(Expr::Str(inner.as_str().to_string())),
            }
        }
        Rule::enum_ref => {
            let mut path: Vec<String> = pair.as_str().split("::").map(str::to_string).collect();
            let label = path.pop().ok_or("enum reference: missing label")?;
            Ok(Expr::EnumRef { path, label })
        }
        Rule::ident => Ok(Expr::Name(pair.as_str().to_string())),
        other => Err(format!("unexpected {:?}", other)),
    }
}

/// Negative literals fold into the constant so `-128` stays an integer literal.
fn fold_unary(op: UnaryOp, e: Expr) -> Expr {
    match (op, e) {
        (UnaryOp::Neg, Expr::Int(v)) => Expr::Int(-v),
        (UnaryOp::Neg, Expr::Float(v)) => Expr::Float(-v),
        (op, e) => Expr::Unary(op, Box::new(e)),
    }
}

fn parse_int(s: &str) -> Result<i128, String> {
    let clean: String = s.chars().filter(|c| *c != '_').collect();
    let (digits, radix) = if let Some(h) = clean.strip_prefix("0x") {
        (h, 16)
    } else if let Some(b) = clean.strip_prefix("0b") {
        (b, 2)
    } else if let Some(o) = clean.strip_prefix("0o") {
        (o, 8)
    } else {
        (clean.as_str(), 10)
    };
    i128::from_str_radix(digits, radix).map_err(|e| format!("integer `{}`: {}", s, e))
}

fn unescape(s: &str) -> Result<String, String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some(other) => return Err(format!("unknown escape \\{}", other)),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

/// State of a stream as seen from an expression (`_io`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRef {
    pub base: u64,
    pub len: u64,
    pub pos: u64,
}

/// Runtime value of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Int(i128),
    Float(f64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    Enum { enum_id: EnumId, value: i128 },
    Struct(ObjId),
    Array(Vec<ExprValue>),
    Io(IoRef),
    Null,
}

impl From<&Value> for ExprValue {
    fn from(v: &Value) -> Self {
        match v {
            Value::Bool(b) => ExprValue::Bool(*b),
            Value::Float(f) => ExprValue::Float(*f as f64),
            Value::Double(f) => ExprValue::Float(*f),
            Value::Bytes(b) => ExprValue::Bytes(b.clone()),
            Value::Str(s) => ExprValue::Str(s.clone()),
            Value::Enum { enum_id, value, .. } => ExprValue::Enum {
                enum_id: *enum_id,
                value: *value,
            },
            Value::Null => ExprValue::Null,
            other => other.as_int().map(ExprValue::Int).unwrap_or(ExprValue::Null),
        }
    }
}

fn type_err(what: &str, v: &ExprValue) -> ExprError {
    ExprError::Type(format!("{} not supported on {}", what, v.kind_name()))
}

impl ExprValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExprValue::Int(_) => "integer",
            ExprValue::Float(_) => "float",
            ExprValue::Bool(_) => "boolean",
            ExprValue::Str(_) => "string",
            ExprValue::Bytes(_) => "byte array",
            ExprValue::Enum { .. } => "enum",
            ExprValue::Struct(_) => "struct",
            ExprValue::Array(_) => "array",
            ExprValue::Io(_) => "stream",
            ExprValue::Null => "null",
        }
    }

    /// Integer view; enum values count as their numeric value.
    pub fn as_int(&self) -> Option<i128> {
        match self {
            ExprValue::Int(v) => Some(*v),
            ExprValue::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn to_int(&self) -> Result<i128, ExprError> {
        self.as_int()
            .ok_or_else(|| ExprError::Type(format!("expected integer, got {}", self.kind_name())))
    }

    pub fn to_bool(&self) -> Result<bool, ExprError> {
        match self {
            ExprValue::Bool(b) => Ok(*b),
            other => Err(ExprError::Type(format!(
                "expected boolean, got {}",
                other.kind_name()
            ))),
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            ExprValue::Float(f) => Some(*f),
            ExprValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Equality as used by `==`, `switch-on` and `valid`: enums compare equal to their
    /// numeric value, integers compare equal to floats of the same value.
    pub fn loose_eq(&self, other: &ExprValue) -> bool {
        match (self, other) {
            (ExprValue::Enum { value: a, .. }, ExprValue::Enum { value: b, .. }) => a == b,
            (ExprValue::Enum { value: a, .. }, ExprValue::Int(b))
            | (ExprValue::Int(a), ExprValue::Enum { value: b, .. }) => a == b,
            (ExprValue::Int(a), ExprValue::Float(b)) | (ExprValue::Float(b), ExprValue::Int(a)) => {
                *a as f64 == *b
            }
            (ExprValue::Array(a), ExprValue::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.loose_eq(y))
            }
            // `magic == [0x50, 0x4b]`
            (ExprValue::Bytes(b), ExprValue::Array(a)) | (ExprValue::Array(a), ExprValue::Bytes(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| x.as_int() == Some(*y as i128))
            }
            (a, b) => a == b,
        }
    }

    fn compare(&self, other: &ExprValue) -> Result<std::cmp::Ordering, ExprError> {
        use std::cmp::Ordering;
        match (self, other) {
            (ExprValue::Str(a), ExprValue::Str(b)) => Ok(a.cmp(b)),
            (ExprValue::Bytes(a), ExprValue::Bytes(b)) => Ok(a.cmp(b)),
            _ => {
                if let (Some(a), Some(b)) = (self.as_int(), other.as_int()) {
                    return Ok(a.cmp(&b));
                }
                match (self.as_float(), other.as_float()) {
                    (Some(a), Some(b)) => Ok(a.partial_cmp(&b).unwrap_or(Ordering::Equal)),
                    _ => Err(ExprError::Type(format!(
                        "cannot compare {} with {}",
                        self.kind_name(),
                        other.kind_name()
                    ))),
                }
            }
        }
    }

    pub fn unary(op: UnaryOp, v: ExprValue) -> Result<ExprValue, ExprError> {
        match (op, &v) {
            (UnaryOp::Neg, ExprValue::Int(x)) => Ok(ExprValue::Int(-x)),
            (UnaryOp::Neg, ExprValue::Float(x)) => Ok(ExprValue::Float(-x)),
            (UnaryOp::BitNot, ExprValue::Int(x)) => Ok(ExprValue::Int(!x)),
            (UnaryOp::Not, ExprValue::Bool(b)) => Ok(ExprValue::Bool(!b)),
            (op, _) => Err(type_err(&format!("{:?}", op), &v)),
        }
    }

    pub fn binary(op: BinOp, l: ExprValue, r: ExprValue) -> Result<ExprValue, ExprError> {
        use std::cmp::Ordering;
        let cmp = |ord: fn(Ordering) -> bool| -> Result<ExprValue, ExprError> {
            Ok(ExprValue::Bool(ord(l.compare(&r)?)))
        };
        match op {
            BinOp::Eq => return Ok(ExprValue::Bool(l.loose_eq(&r))),
            BinOp::Ne => return Ok(ExprValue::Bool(!l.loose_eq(&r))),
            BinOp::Lt => return cmp(|o| o == Ordering::Less),
            BinOp::Le => return cmp(|o| o != Ordering::Greater),
            BinOp::Gt => return cmp(|o| o == Ordering::Greater),
            BinOp::Ge => return cmp(|o| o != Ordering::Less),
            BinOp::And => return Ok(ExprValue::Bool(l.to_bool()? && r.to_bool()?)),
            BinOp::Or => return Ok(ExprValue::Bool(l.to_bool()? || r.to_bool()?)),
            _ => {}
        }
        match (&l, &r) {
            (ExprValue::Int(a), ExprValue::Int(b)) => int_op(op, *a, *b),
            (ExprValue::Str(a), ExprValue::Str(b)) if op == BinOp::Add => {
                Ok(ExprValue::Str(format!("{}{}", a, b)))
            }
            (ExprValue::Bytes(a), ExprValue::Bytes(b)) if op == BinOp::Add => {
                Ok(ExprValue::Bytes([a.as_slice(), b.as_slice()].concat()))
            }
            _ => match (l.as_float(), r.as_float()) {
                (Some(a), Some(b)) => float_op(op, a, b),
                _ => Err(ExprError::Type(format!(
                    "{:?} not supported between {} and {}",
                    op,
                    l.kind_name(),
                    r.kind_name()
                ))),
            },
        }
    }

    /// Built-in property access (`x.length`, `_io.eof`, ...). Struct members are resolved by
    /// the engine before falling back here.
    pub fn property(&self, name: &str) -> Result<ExprValue, ExprError> {
        match (self, name) {
            (ExprValue::Str(s), "length") => Ok(ExprValue::Int(s.chars().count() as i128)),
            (ExprValue::Str(s), "reverse") => Ok(ExprValue::Str(s.chars().rev().collect())),
            (ExprValue::Str(_), "to_i") => self.method("to_i", &[]),
            (ExprValue::Bytes(b), "size" | "length") => Ok(ExprValue::Int(b.len() as i128)),
            (ExprValue::Bytes(b), "first") => b
                .first()
                .map(|x| ExprValue::Int(*x as i128))
                .ok_or(ExprError::IndexOutOfRange { index: 0, len: 0 }),
            (ExprValue::Bytes(b), "last") => b
                .last()
                .map(|x| ExprValue::Int(*x as i128))
                .ok_or(ExprError::IndexOutOfRange { index: -1, len: 0 }),
            (ExprValue::Bytes(b), "min") => Ok(b
                .iter()
                .min()
                .map(|x| ExprValue::Int(*x as i128))
                .unwrap_or(ExprValue::Null)),
            (ExprValue::Bytes(b), "max") => Ok(b
                .iter()
                .max()
                .map(|x| ExprValue::Int(*x as i128))
                .unwrap_or(ExprValue::Null)),
            (ExprValue::Array(a), "size" | "length") => Ok(ExprValue::Int(a.len() as i128)),
            (ExprValue::Array(a), "first") => a
                .first()
                .cloned()
                .ok_or(ExprError::IndexOutOfRange { index: 0, len: 0 }),
            (ExprValue::Array(a), "last") => a
                .last()
                .cloned()
                .ok_or(ExprError::IndexOutOfRange { index: -1, len: 0 }),
            (ExprValue::Array(a), "min" | "max") => {
                let mut best: Option<&ExprValue> = None;
                for item in a {
                    best = match best {
                        None => Some(item),
                        Some(cur) => {
                            let ord = item.compare(cur)?;
                            let better = if name == "min" {
                                ord == std::cmp::Ordering::Less
                            } else {
                                ord == std::cmp::Ordering::Greater
                            };
                            Some(if better { item } else { cur })
                        }
                    };
                }
                Ok(best.cloned().unwrap_or(ExprValue::Null))
            }
            (ExprValue::Int(v), "to_s") => Ok(ExprValue::Str(v.to_string())),
            (ExprValue::Int(_), "to_i") => Ok(self.clone()),
            (ExprValue::Float(f), "to_i") => Ok(ExprValue::Int(f.trunc() as i128)),
            (ExprValue::Bool(b), "to_i") => Ok(ExprValue::Int(*b as i128)),
            (ExprValue::Enum { value, .. }, "to_i") => Ok(ExprValue::Int(*value)),
            (ExprValue::Io(io), "eof") => Ok(ExprValue::Bool(io.pos >= io.len)),
            (ExprValue::Io(io), "pos") => Ok(ExprValue::Int(io.pos as i128)),
            (ExprValue::Io(io), "size") => Ok(ExprValue::Int(io.len as i128)),
            _ => Err(ExprError::Type(format!(
                "{} has no property `{}`",
                self.kind_name(),
                name
            ))),
        }
    }

    /// Built-in method call (`to_i(16)`, `to_s("UTF-8")`, `substring(a, b)`).
    pub fn method(&self, name: &str, args: &[ExprValue]) -> Result<ExprValue, ExprError> {
        match (self, name, args) {
            (ExprValue::Str(s), "to_i", _) => {
                let radix = match args.first() {
                    Some(r) => u32::try_from(r.to_int()?)
                        .map_err(|_| ExprError::Type("radix out of range".to_string()))?,
                    None => 10,
                };
                if !(2..=36).contains(&radix) {
                    return Err(ExprError::Type(format!("radix {} out of range", radix)));
                }
                i128::from_str_radix(s.trim(), radix)
                    .map(ExprValue::Int)
                    .map_err(|e| ExprError::Type(format!("cannot convert `{}` to integer: {}", s, e)))
            }
            (ExprValue::Bytes(b), "to_s", [ExprValue::Str(enc)]) => {
                let encoding = Encoding::from_name(enc)
                    .ok_or_else(|| ExprError::Type(format!("unknown encoding `{}`", enc)))?;
                Ok(ExprValue::Str(decode_str(b, encoding)))
            }
            (ExprValue::Int(v), "to_s", [radix]) => {
                let radix = radix.to_int()?;
                Ok(ExprValue::Str(match radix {
                    2 => format!("{:b}", v),
                    8 => format!("{:o}", v),
                    10 => v.to_string(),
                    16 => format!("{:x}", v),
                    other => return Err(ExprError::Type(format!("radix {} unsupported", other))),
                }))
            }
            (ExprValue::Str(s), "substring", [from, to]) => {
                let chars: Vec<char> = s.chars().collect();
                let from = clamp_index(from.to_int()?, chars.len());
                let to = clamp_index(to.to_int()?, chars.len()).max(from);
                Ok(ExprValue::Str(chars[from..to].iter().collect()))
            }
            (_, _, []) => self.property(name),
            _ => Err(ExprError::Type(format!(
                "{} has no method `{}` taking {} argument(s)",
                self.kind_name(),
                name,
                args.len()
            ))),
        }
    }

    /// `value[idx]` for arrays and byte arrays.
    pub fn index(&self, idx: &ExprValue) -> Result<ExprValue, ExprError> {
        let i = idx.to_int()?;
        let (len, item) = match self {
            ExprValue::Array(a) => (
                a.len(),
                usize::try_from(i).ok().and_then(|i| a.get(i)).cloned(),
            ),
            ExprValue::Bytes(b) => (
                b.len(),
                usize::try_from(i)
                    .ok()
                    .and_then(|i| b.get(i))
                    .map(|x| ExprValue::Int(*x as i128)),
            ),
            other => return Err(type_err("indexing", other)),
        };
        item.ok_or(ExprError::IndexOutOfRange { index: i, len })
    }
}

fn clamp_index(i: i128, len: usize) -> usize {
    usize::try_from(i.max(0)).unwrap_or(usize::MAX).min(len)
}

fn int_op(op: BinOp, a: i128, b: i128) -> Result<ExprValue, ExprError> {
    let v = match op {
        BinOp::Add => a.checked_add(b).ok_or(ExprError::Overflow("+"))?,
        BinOp::Sub => a.checked_sub(b).ok_or(ExprError::Overflow("-"))?,
        BinOp::Mul => a.checked_mul(b).ok_or(ExprError::Overflow("*"))?,
        BinOp::Div => {
            if b == 0 {
                return Err(ExprError::DivisionByZero);
            }
            // Rounds toward negative infinity.
            let q = a / b;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(ExprError::DivisionByZero);
            }
            a.rem_euclid(b)
        }
        BinOp::Shl => {
            let s = u32::try_from(b).ok().filter(|s| *s < 128).ok_or(ExprError::Overflow("<<"))?;
            a.checked_shl(s).ok_or(ExprError::Overflow("<<"))?
        }
        BinOp::Shr => {
            let s = u32::try_from(b).ok().filter(|s| *s < 128).ok_or(ExprError::Overflow(">>"))?;
            a >> s
        }
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        other => {
            return Err(ExprError::Type(format!(
                "{:?} not supported between integers",
                other
            )))
        }
    };
    Ok(ExprValue::Int(v))
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<ExprValue, ExprError> {
    Ok(ExprValue::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            a / b
        }
        other => {
            return Err(ExprError::Type(format!(
                "{:?} not supported between floats",
                other
            )))
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Box<Expr> {
        Box::new(Expr::Name(s.to_string()))
    }

    #[test]
    fn precedence_mul_over_add() {
        let e = parse_expr("a + b * 2").expect("parse");
        assert_eq!(
            e,
            Expr::Binary(
                BinOp::Add,
                name("a"),
                Box::new(Expr::Binary(BinOp::Mul, name("b"), Box::new(Expr::Int(2))))
            )
        );
    }

    #[test]
    fn left_associative_subtraction() {
        let e = parse_expr("10 - 3 - 2").expect("parse");
        let Expr::Binary(BinOp::Sub, lhs, rhs) = e else {
            panic!("expected subtraction");
        };
        assert_eq!(*rhs, Expr::Int(2));
        assert!(matches!(*lhs, Expr::Binary(BinOp::Sub, _, _)));
    }

    #[test]
    fn integer_literal_forms() {
        assert_eq!(parse_expr("0x1F").expect("hex"), Expr::Int(31));
        assert_eq!(parse_expr("0b1010").expect("bin"), Expr::Int(10));
        assert_eq!(parse_expr("0o17").expect("oct"), Expr::Int(15));
        assert_eq!(parse_expr("1_000").expect("dec"), Expr::Int(1000));
        assert_eq!(parse_expr("-128").expect("neg"), Expr::Int(-128));
        assert_eq!(parse_expr("1.5").expect("float"), Expr::Float(1.5));
    }

    #[test]
    fn keywords_and_identifiers() {
        let e = parse_expr("not has_data and order > 1").expect("parse");
        assert!(matches!(e, Expr::Binary(BinOp::And, _, _)));
        assert!(e.mentions("order"));
        assert!(e.mentions("has_data"));
    }

    #[test]
    fn postfix_chain() {
        let e = parse_expr("_root.header.entries[0].name.to_s(\"UTF-8\")").expect("parse");
        let Expr::Call(_, method, args) = e else {
            panic!("expected call");
        };
        assert_eq!(method, "to_s");
        assert_eq!(args, vec![Expr::Str("UTF-8".to_string())]);
    }

    #[test]
    fn enum_ref_and_cast() {
        let e = parse_expr("kind == chunk_type::data").expect("parse");
        let Expr::Binary(BinOp::Eq, _, rhs) = e else {
            panic!("expected comparison");
        };
        assert_eq!(
            *rhs,
            Expr::EnumRef {
                path: vec!["chunk_type".to_string()],
                label: "data".to_string()
            }
        );
        assert!(matches!(
            parse_expr("body.as<header>").expect("cast"),
            Expr::Cast(_, ref t) if t == "header"
        ));
    }

    #[test]
    fn ternary_and_strings() {
        let e = parse_expr("flag ? 'a' : \"b\\n\"").expect("parse");
        assert_eq!(
            e,
            Expr::Ternary(
                name("flag"),
                Box::new(Expr::Str("a".to_string())),
                Box::new(Expr::Str("b\n".to_string()))
            )
        );
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(matches!(parse_expr("a +"), Err(ExprError::Syntax { .. })));
        assert!(matches!(parse_expr(""), Err(ExprError::Syntax { .. })));
        assert!(parse_expr_list("1, x + 2").expect("list").len() == 2);
    }

    #[test]
    fn floor_division_and_modulo() {
        let div = ExprValue::binary(BinOp::Div, ExprValue::Int(-7), ExprValue::Int(2));
        assert_eq!(div, Ok(ExprValue::Int(-4)));
        let m = ExprValue::binary(BinOp::Mod, ExprValue::Int(-7), ExprValue::Int(3));
        assert_eq!(m, Ok(ExprValue::Int(2)));
        assert_eq!(
            ExprValue::binary(BinOp::Div, ExprValue::Int(1), ExprValue::Int(0)),
            Err(ExprError::DivisionByZero)
        );
    }

    #[test]
    fn enum_compares_with_integer() {
        let e = ExprValue::Enum { enum_id: 0, value: 3 };
        assert!(e.loose_eq(&ExprValue::Int(3)));
        assert_eq!(
            ExprValue::binary(BinOp::Ne, e, ExprValue::Int(4)),
            Ok(ExprValue::Bool(true))
        );
    }

    #[test]
    fn builtin_properties() {
        let b = ExprValue::Bytes(vec![3, 9, 1]);
        assert_eq!(b.property("size"), Ok(ExprValue::Int(3)));
        assert_eq!(b.property("max"), Ok(ExprValue::Int(9)));
        assert_eq!(b.index(&ExprValue::Int(1)), Ok(ExprValue::Int(9)));
        let s = ExprValue::Str("ff".to_string());
        assert_eq!(s.method("to_i", &[ExprValue::Int(16)]), Ok(ExprValue::Int(255)));
        let io = ExprValue::Io(IoRef { base: 0, len: 4, pos: 4 });
        assert_eq!(io.property("eof"), Ok(ExprValue::Bool(true)));
    }
}
