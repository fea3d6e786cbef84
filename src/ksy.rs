//! Serde model of a `.ksy` document (YAML).
//!
//! This is a faithful, loosely-typed image of the file: attribute values that may be either
//! literals or expressions are kept as [`serde_yaml::Value`] and turned into expression
//! source text by the compiler. Mappings whose order matters (`types`, `instances`, `enums`,
//! switch `cases`) deserialize into [`Ordered`].

use std::fmt;
use std::marker::PhantomData;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_yaml::Value as Yaml;

/// A YAML mapping that keeps document order.
#[derive(Debug, Clone, PartialEq)]
pub struct Ordered<K, V>(pub Vec<(K, V)>);

impl<K, V> Default for Ordered<K, V> {
    fn default() -> Self {
        Ordered(Vec::new())
    }
}

impl<K, V> Ordered<K, V> {
    pub fn iter(&self) -> impl Iterator<Item = &(K, V)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de, K, V> Deserialize<'de> for Ordered<K, V>
where
    K: Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor<K, V>(PhantomData<(K, V)>);

        impl<'de, K, V> Visitor<'de> for OrderedVisitor<K, V>
        where
            K: Deserialize<'de>,
            V: Deserialize<'de>,
        {
            type Value = Ordered<K, V>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Ordered(Vec::new()))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((k, v)) = map.next_entry()? {
                    entries.push((k, v));
                }
                Ok(Ordered(entries))
            }
        }

        deserializer.deserialize_map(OrderedVisitor(PhantomData))
    }
}

/// A type body: the document root or an entry of `types`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KsyType {
    #[serde(default)]
    pub meta: Option<KsyMeta>,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub params: Vec<KsyParam>,
    #[serde(default)]
    pub seq: Vec<KsyAttr>,
    #[serde(default)]
    pub types: Ordered<String, KsyType>,
    #[serde(default)]
    pub instances: Ordered<String, KsyAttr>,
    #[serde(default)]
    pub enums: Ordered<String, Ordered<Yaml, Yaml>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KsyMeta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// `be`, `le`, or a switch mapping (rejected by the compiler).
    #[serde(default)]
    pub endian: Option<Yaml>,
    #[serde(default)]
    pub bit_endian: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub ks_version: Option<Yaml>,
    #[serde(default)]
    pub file_extension: Option<Yaml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KsyParam {
    pub id: String,
    #[serde(default, rename = "type")]
    pub ty: Option<String>,
    #[serde(default, rename = "enum")]
    pub enum_name: Option<String>,
    #[serde(default)]
    pub doc: Option<String>,
}

/// `type:` is either a type name or a switch.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum KsyTypeRef {
    Name(String),
    Switch(KsySwitch),
}

#[derive(Debug, Clone, Deserialize)]
pub struct KsySwitch {
    #[serde(rename = "switch-on")]
    pub switch_on: Yaml,
    #[serde(default)]
    pub cases: Ordered<Yaml, String>,
}

/// A `seq` attribute or an instance specification.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KsyAttr {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "type")]
    pub ty: Option<KsyTypeRef>,
    #[serde(default)]
    pub size: Option<Yaml>,
    #[serde(default)]
    pub size_eos: Option<bool>,
    #[serde(default)]
    pub terminator: Option<Yaml>,
    #[serde(default)]
    pub include: Option<bool>,
    #[serde(default)]
    pub consume: Option<bool>,
    #[serde(default)]
    pub eos_error: Option<bool>,
    #[serde(default)]
    pub pad_right: Option<u8>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub contents: Option<Yaml>,
    #[serde(default)]
    pub repeat: Option<String>,
    #[serde(default)]
    pub repeat_expr: Option<Yaml>,
    #[serde(default)]
    pub repeat_until: Option<Yaml>,
    #[serde(default, rename = "if")]
    pub condition: Option<Yaml>,
    #[serde(default, rename = "enum")]
    pub enum_name: Option<String>,
    #[serde(default)]
    pub valid: Option<Yaml>,
    #[serde(default)]
    pub process: Option<String>,
    #[serde(default)]
    pub pos: Option<Yaml>,
    #[serde(default)]
    pub io: Option<Yaml>,
    #[serde(default)]
    pub value: Option<Yaml>,
    #[serde(default)]
    pub doc: Option<String>,
}

/// Parse a `.ksy` document.
pub fn from_str(text: &str) -> Result<KsyType, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

/// Render a literal-or-expression attribute as expression source.
pub fn expr_source(v: &Yaml) -> Result<String, String> {
    match v {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Number(n) => Ok(n.to_string()),
        Yaml::Bool(b) => Ok(b.to_string()),
        Yaml::Null => Err("expected an expression, found null".to_string()),
        other => Err(format!("expected an expression, found {}", yaml_kind(other))),
    }
}

/// Bytes of a `contents`/`terminator` value: an integer, a string, or a list of either.
pub fn literal_bytes(v: &Yaml) -> Result<Vec<u8>, String> {
    match v {
        Yaml::String(s) => Ok(s.as_bytes().to_vec()),
        Yaml::Number(n) => n
            .as_u64()
            .and_then(|x| u8::try_from(x).ok())
            .map(|b| vec![b])
            .ok_or_else(|| format!("byte value {} out of range", n)),
        Yaml::Sequence(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(literal_bytes(item)?);
            }
            Ok(out)
        }
        other => Err(format!("expected bytes, found {}", yaml_kind(other))),
    }
}

/// Integer key of an `enums` entry (`0x1f: label` or `"0x1f": label`).
pub fn enum_key(v: &Yaml) -> Result<i128, String> {
    match v {
        Yaml::Number(n) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .ok_or_else(|| format!("enum key {} is not an integer", n)),
        Yaml::String(s) => {
            let t = s.trim().replace('_', "");
            let (neg, t) = match t.strip_prefix('-') {
                Some(rest) => (true, rest.to_string()),
                None => (false, t),
            };
            let parsed = if let Some(h) = t.strip_prefix("0x") {
                i128::from_str_radix(h, 16)
            } else if let Some(b) = t.strip_prefix("0b") {
                i128::from_str_radix(b, 2)
            } else if let Some(o) = t.strip_prefix("0o") {
                i128::from_str_radix(o, 8)
            } else {
                t.parse::<i128>()
            };
            parsed
                .map(|x| if neg { -x } else { x })
                .map_err(|_| format!("enum key `{}` is not an integer", s))
        }
        Yaml::Bool(b) => Ok(*b as i128),
        other => Err(format!("enum key must be an integer, found {}", yaml_kind(other))),
    }
}

/// Label of an `enums` entry: a plain identifier or a mapping with `id`.
pub fn enum_label(v: &Yaml) -> Result<String, String> {
    match v {
        Yaml::String(s) => Ok(s.clone()),
        Yaml::Mapping(m) => m
            .get(Yaml::String("id".to_string()))
            .and_then(Yaml::as_str)
            .map(str::to_string)
            .ok_or_else(|| "enum entry mapping without `id`".to_string()),
        other => Err(format!("enum label must be a string, found {}", yaml_kind(other))),
    }
}

pub fn yaml_kind(v: &Yaml) -> &'static str {
    match v {
        Yaml::Null => "null",
        Yaml::Bool(_) => "boolean",
        Yaml::Number(_) => "number",
        Yaml::String(_) => "string",
        Yaml::Sequence(_) => "list",
        Yaml::Mapping(_) => "mapping",
        Yaml::Tagged(_) => "tagged value",
    }
}
