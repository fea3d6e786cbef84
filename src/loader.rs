//! Schema loader: resolves a schema URI, reads it, runs the compiler, caches the result.
//!
//! Definitions are cached by [`SchemaIdentity`] (canonical URI plus content digest), so an
//! edited file or a same-named file elsewhere never reuses a stale definition. Concurrent
//! loads of one identity are serialized: the first caller compiles, the others wait and
//! then hit the cache.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::ast::{DecoderDefinition, SchemaIdentity};
use crate::compiler::{CompileError, CompileOutput, CompileRequest, KsyCompiler, SchemaCompiler};

/// How long to keep polling a compiler that reported [`CompileOutput::Pending`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 20,
            interval_ms: 10,
        }
    }
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Reported in every [`CompileRequest`] and stored in the produced definition.
    pub compiler_version: String,
    pub retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            compiler_version: env!("CARGO_PKG_VERSION").to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl LoaderConfig {
    /// Read a config from YAML, e.g. `retry: { attempts: 5, interval_ms: 50 }`.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("cannot read schema {uri}: {source}")]
    Resource {
        uri: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("invalid schema URI: {0}")]
    InvalidUri(String),
}

#[derive(Default)]
struct CacheState {
    definitions: HashMap<SchemaIdentity, Arc<DecoderDefinition>>,
    in_flight: HashSet<SchemaIdentity>,
}

pub struct SchemaLoader {
    config: LoaderConfig,
    compiler: Box<dyn SchemaCompiler>,
    state: Mutex<CacheState>,
    compiled: Condvar,
}

impl std::fmt::Debug for SchemaLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaLoader")
            .field("config", &self.config)
            .field("cached", &self.cached_len())
            .finish()
    }
}

impl Default for SchemaLoader {
    fn default() -> Self {
        SchemaLoader::new(LoaderConfig::default())
    }
}

impl SchemaLoader {
    /// Loader backed by the built-in [`KsyCompiler`].
    pub fn new(config: LoaderConfig) -> Self {
        SchemaLoader::with_compiler(config, Box::new(KsyCompiler::new()))
    }

    pub fn with_compiler(config: LoaderConfig, compiler: Box<dyn SchemaCompiler>) -> Self {
        SchemaLoader {
            config,
            compiler,
            state: Mutex::new(CacheState::default()),
            compiled: Condvar::new(),
        }
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a schema from a `file://` URL or a filesystem path.
    pub fn load(&self, uri: &str) -> Result<Arc<DecoderDefinition>, LoadError> {
        let (canonical, path) = resolve_uri(uri)?;
        let source = std::fs::read_to_string(&path).map_err(|source| LoadError::Resource {
            uri: canonical.clone(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| canonical.clone());
        self.load_source(SchemaIdentity::new(canonical, source.as_bytes()), name, source)
    }

    /// Load schema text that has no backing file; cached under `memory:<name>`.
    pub fn load_str(&self, name: &str, source: &str) -> Result<Arc<DecoderDefinition>, LoadError> {
        let identity = SchemaIdentity::new(format!("memory:{}", name), source.as_bytes());
        self.load_source(identity, name.to_string(), source.to_string())
    }

    fn load_source(
        &self,
        identity: SchemaIdentity,
        name: String,
        source: String,
    ) -> Result<Arc<DecoderDefinition>, LoadError> {
        let mut state = self.lock();
        loop {
            if let Some(def) = state.definitions.get(&identity) {
                log::debug!("schema {} served from cache", identity.uri);
                return Ok(Arc::clone(def));
            }
            if !state.in_flight.contains(&identity) {
                break;
            }
            log::trace!("waiting for in-flight compile of {}", identity.uri);
            state = self
                .compiled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.in_flight.insert(identity.clone());
        drop(state);
        let _in_flight = InFlight {
            loader: self,
            identity: &identity,
        };

        let request = CompileRequest {
            identity: identity.clone(),
            name,
            source,
            compiler_version: self.config.compiler_version.clone(),
        };
        let def = Arc::new(self.compile_with_retry(&request)?);
        self.lock().definitions.insert(identity.clone(), Arc::clone(&def));
        Ok(def)
    }

    fn compile_with_retry(&self, request: &CompileRequest) -> Result<DecoderDefinition, CompileError> {
        log::debug!(
            "compiling {} with compiler version {}",
            request.identity.uri,
            request.compiler_version
        );
        let retry = &self.config.retry;
        let mut output = self.compiler.compile(request)?;
        let mut attempts = 0;
        loop {
            match output {
                CompileOutput::Ready(def) => return Ok(def),
                CompileOutput::Pending if attempts >= retry.attempts => {
                    log::warn!(
                        "compiler produced no output for {} after {} poll(s)",
                        request.identity.uri,
                        attempts
                    );
                    return Err(CompileError::new(
                        request.name.clone(),
                        format!("compiler produced no output after {} poll(s)", attempts),
                    ));
                }
                CompileOutput::Pending => {
                    attempts += 1;
                    std::thread::sleep(retry.interval());
                    output = self.compiler.poll(request)?;
                }
            }
        }
    }

    /// Drop every cached definition compiled from `uri` (all content versions). A file that
    /// can no longer be resolved is matched by its literal URI.
    pub fn invalidate(&self, uri: &str) -> usize {
        let canonical = if uri.starts_with("memory:") {
            uri.to_string()
        } else {
            resolve_uri(uri).map(|(c, _)| c).unwrap_or_else(|_| uri.to_string())
        };
        let mut state = self.lock();
        let before = state.definitions.len();
        state.definitions.retain(|id, _| id.uri != canonical);
        let removed = before - state.definitions.len();
        log::debug!("invalidated {} cached definition(s) for {}", removed, canonical);
        removed
    }

    pub fn clear(&self) {
        self.lock().definitions.clear();
    }

    pub fn cached_len(&self) -> usize {
        self.lock().definitions.len()
    }
}

/// Clears an identity's in-flight mark and wakes waiters, also when the compiler panics.
struct InFlight<'l> {
    loader: &'l SchemaLoader,
    identity: &'l SchemaIdentity,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.loader.lock().in_flight.remove(self.identity);
        self.loader.compiled.notify_all();
    }
}

/// Canonical `file://` URL and filesystem path for a schema reference.
pub fn resolve_uri(uri: &str) -> Result<(String, PathBuf), LoadError> {
    let path = match Url::parse(uri) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| LoadError::InvalidUri(uri.to_string()))?,
        // `C:\schemas\x.ksy` parses as a URL with a one-letter scheme.
        Ok(url) if url.scheme().len() == 1 => PathBuf::from(uri),
        Ok(url) => {
            return Err(LoadError::InvalidUri(format!(
                "unsupported scheme `{}` in {}",
                url.scheme(),
                uri
            )))
        }
        Err(_) => PathBuf::from(uri),
    };
    let canonical = std::fs::canonicalize(&path).map_err(|source| LoadError::Resource {
        uri: uri.to_string(),
        source,
    })?;
    let url = Url::from_file_path(&canonical)
        .map_err(|_| LoadError::InvalidUri(canonical.display().to_string()))?;
    Ok((url.to_string(), canonical))
}
