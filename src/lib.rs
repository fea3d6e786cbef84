//! # ksinspect: schema-driven binary inspection
//!
//! Decode a byte buffer with a [Kaitai Struct](https://kaitai.io) `.ksy` schema into a
//! lazily expandable parse tree where every node carries its name, type, value and exact
//! byte range, ready to drive a tree view and hex highlighting.
//!
//! ## Pipeline
//!
//! - **Byte source** ([`stream`]): bounded, read-only cursor over host data ([`BinaryData`]).
//! - **Schema loader** ([`loader`], [`compiler`]): resolve a URI, compile the YAML into a
//!   static [`DecoderDefinition`] once, cache it by URI and content digest.
//! - **Decoding engine** ([`engine`]): interpret the definition over the bytes, recording
//!   ranges; failures name the full field path.
//! - **Parse tree** ([`tree`]): nodes materialized one level per expansion, instances
//!   evaluated on demand, invalidation with generation-tagged node ids.
//! - **Highlight bridge** ([`highlight`]): node selection to range/clear events.
//! - **Session** ([`session`]): status reporting across compile and parse.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ksinspect::{dump, ParseTreeModel, SchemaLoader};
//!
//! let loader = SchemaLoader::default();
//! let definition = loader.load("formats/gif.ksy")?;
//! let data = std::fs::read("image.gif")?;
//! let mut tree = ParseTreeModel::new(definition, Arc::new(data));
//! print!("{}", dump::dump_tree(&mut tree, Some(2), true)?);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod ast;
pub mod compiler;
pub mod dump;
pub mod engine;
pub mod expr;
pub mod highlight;
pub mod ksy;
pub mod loader;
pub mod session;
pub mod stream;
pub mod tree;
pub mod value;

pub use ast::{DecoderDefinition, FieldKind, SchemaIdentity};
pub use compiler::{compile_str, CompileError, KsyCompiler, SchemaCompiler};
pub use engine::{decode, CancelToken, DecodeError, DecodeErrorKind, DecodeOptions, DecodedTree};
pub use highlight::{HighlightBridge, HighlightEvent, HighlightSink};
pub use loader::{LoadError, LoaderConfig, RetryPolicy, SchemaLoader};
pub use session::{Inspector, Status, StatusSink};
pub use stream::{BinaryData, ByteSource, Endianness, StreamError};
pub use tree::{NodeId, NodeValue, ParseNode, ParseTreeModel, TreeError};
pub use value::Value;
