//! Inspector session: schema selection, decoding and status reporting for one buffer.
//!
//! Every state change goes out through a [`StatusSink`] in the order
//! `NoDefinition → Compiling → (CompileFailed | Parsing → (ParseFailed | Ok))`. The last
//! failure text stays available through [`Inspector::processing_message`].

use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use crate::engine::{CancelToken, DecodeOptions};
use crate::loader::SchemaLoader;
use crate::stream::BinaryData;
use crate::tree::ParseTreeModel;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    NoDefinition,
    Compiling,
    CompileFailed(String),
    Parsing,
    ParseFailed(String),
    Ok,
}

impl Status {
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::CompileFailed(_) | Status::ParseFailed(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::NoDefinition => f.write_str("no definition"),
            Status::Compiling => f.write_str("compiling"),
            Status::CompileFailed(_) => f.write_str("compilation failed"),
            Status::Parsing => f.write_str("parsing"),
            Status::ParseFailed(_) => f.write_str("parsing failed"),
            Status::Ok => f.write_str("ok"),
        }
    }
}

pub trait StatusSink {
    fn emit(&mut self, status: &Status);
}

impl<F: FnMut(&Status)> StatusSink for F {
    fn emit(&mut self, status: &Status) {
        self(status)
    }
}

impl StatusSink for Sender<Status> {
    fn emit(&mut self, status: &Status) {
        let _ = self.send(status.clone());
    }
}

pub struct Inspector<S> {
    loader: Arc<SchemaLoader>,
    sink: S,
    status: Status,
    message: Option<String>,
    schema: Option<String>,
    data: Arc<dyn BinaryData + Send + Sync>,
    options: DecodeOptions,
    tree: Option<ParseTreeModel>,
}

impl<S> fmt::Debug for Inspector<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inspector")
            .field("status", &self.status)
            .field("schema", &self.schema)
            .field("size", &self.data.size())
            .field("tree", &self.tree)
            .finish()
    }
}

impl<S: StatusSink> Inspector<S> {
    /// New session over an empty buffer; emits [`Status::NoDefinition`].
    pub fn new(loader: Arc<SchemaLoader>, mut sink: S) -> Self {
        let status = Status::NoDefinition;
        sink.emit(&status);
        Inspector {
            loader,
            sink,
            status,
            message: None,
            schema: None,
            data: Arc::new(Vec::new()),
            options: DecodeOptions::default(),
            tree: None,
        }
    }

    fn set_status(&mut self, status: Status) {
        log::debug!("inspector status: {}", status);
        match &status {
            Status::CompileFailed(msg) | Status::ParseFailed(msg) => {
                self.message = Some(msg.clone())
            }
            Status::Ok | Status::NoDefinition => self.message = None,
            _ => {}
        }
        self.sink.emit(&status);
        self.status = status;
    }

    /// Load and compile `uri`, then decode the current buffer with it.
    pub fn select_schema(&mut self, uri: &str) -> &Status {
        self.schema = Some(uri.to_string());
        self.tree = None;
        self.set_status(Status::Compiling);
        match self.loader.load(uri) {
            Ok(definition) => {
                self.tree = Some(ParseTreeModel::with_options(
                    definition,
                    Arc::clone(&self.data),
                    self.options.clone(),
                ));
                self.parse()
            }
            Err(e) => {
                log::warn!("schema {} failed to compile: {}", uri, e);
                self.set_status(Status::CompileFailed(e.to_string()));
                &self.status
            }
        }
    }

    /// The selected schema file changed on disk: drop its cached definition and reload.
    pub fn schema_changed(&mut self) -> &Status {
        match self.schema.clone() {
            Some(uri) => {
                self.loader.invalidate(&uri);
                self.select_schema(&uri)
            }
            None => &self.status,
        }
    }

    pub fn clear_schema(&mut self) {
        self.schema = None;
        self.tree = None;
        self.set_status(Status::NoDefinition);
    }

    /// Replace the inspected buffer and decode it again if a schema is selected.
    pub fn set_data(&mut self, data: Arc<dyn BinaryData + Send + Sync>) -> &Status {
        self.data = Arc::clone(&data);
        match &mut self.tree {
            Some(tree) => {
                tree.set_data(data);
                self.parse()
            }
            None => &self.status,
        }
    }

    /// Root arguments for the next decode (see [`DecoderDefinition::default_arguments`](crate::ast::DecoderDefinition::default_arguments)).
    pub fn set_arguments(&mut self, arguments: Vec<Value>) {
        self.options.arguments = arguments;
        if let Some(tree) = &mut self.tree {
            tree.set_options(self.options.clone());
        }
    }

    /// Cancels any decode started from this session.
    pub fn cancel_token(&self) -> CancelToken {
        self.options.cancel.clone()
    }

    /// Decode again from scratch with the current schema and buffer.
    pub fn reparse(&mut self) -> &Status {
        if self.tree.is_none() {
            return match self.schema.clone() {
                Some(uri) => self.select_schema(&uri),
                None => &self.status,
            };
        }
        if self.options.cancel.is_cancelled() {
            self.options.cancel = CancelToken::new();
            if let Some(tree) = &mut self.tree {
                tree.set_options(self.options.clone());
            }
        }
        if let Some(tree) = &mut self.tree {
            tree.invalidate();
        }
        self.parse()
    }

    fn parse(&mut self) -> &Status {
        self.set_status(Status::Parsing);
        let result = match &mut self.tree {
            Some(tree) => tree.root().map(|_| ()),
            None => return &self.status,
        };
        match result {
            Ok(()) => self.set_status(Status::Ok),
            Err(e) => {
                log::warn!("decode failed: {}", e);
                self.set_status(Status::ParseFailed(e.to_string()));
            }
        }
        &self.status
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Text of the last compile or parse failure.
    pub fn processing_message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn loader(&self) -> &Arc<SchemaLoader> {
        &self.loader
    }

    pub fn tree(&self) -> Option<&ParseTreeModel> {
        self.tree.as_ref()
    }

    pub fn tree_mut(&mut self) -> Option<&mut ParseTreeModel> {
        self.tree.as_mut()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}
