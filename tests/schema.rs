//! Schema loader and compiler tests: diagnostics, parameter defaults, scoping, identity
//! cache, invalidation, bounded retry, and serialized concurrent compiles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ksinspect::ast::{FieldKind, ParamType, ReadSpec};
use ksinspect::compiler::{CompileOutput, CompileRequest};
use ksinspect::{
    compile_str, CompileError, KsyCompiler, LoadError, LoaderConfig, RetryPolicy, SchemaCompiler,
    SchemaLoader, Value,
};
use tempfile::TempDir;

const HEADER: &str = r#"
meta:
  id: header
  endian: le
seq:
  - id: magic
    contents: [0x4b, 0x53]
  - id: version
    type: u2
  - id: body
    type: body
types:
  body:
    seq:
      - id: kind
        type: u1
        enum: kind
      - id: flags
        type: flags
    types:
      flags:
        seq:
          - id: compressed
            type: b1
          - id: reserved
            type: b7
enums:
  kind:
    0: empty
    1: data
"#;

fn fast_retry(attempts: u32) -> LoaderConfig {
    LoaderConfig {
        retry: RetryPolicy {
            attempts,
            interval_ms: 1,
        },
        ..LoaderConfig::default()
    }
}

fn compile_err(src: &str) -> CompileError {
    compile_str("t", src).expect_err("schema should not compile")
}

#[test]
fn test_compile_nested_types_and_enums() {
    let def = compile_str("header", HEADER).expect("compile");
    assert_eq!(def.id, "header");
    assert_eq!(def.root().name, "header");
    assert_eq!(def.types.len(), 3);
    let body = def.resolve_type(0, &["body"]).expect("body");
    let flags = def.resolve_type(body, &["flags"]).expect("flags");
    assert_eq!(def.get_type(flags).path, vec!["header", "body", "flags"]);
    // enums declared at the root are visible from nested scopes
    assert!(def.resolve_enum(flags, &["kind"]).is_some());
    let seq = &def.root().seq;
    assert_eq!(seq[0].contents.as_deref(), Some(&[0x4b, 0x53][..]));
    assert_eq!(seq[1].read.type_name(&def), "u2le");
    assert_eq!(seq[2].kind(), FieldKind::Compound);
    assert!(matches!(
        def.get_type(flags).seq[0].read,
        ReadSpec::BitInt { width: 1, .. }
    ));
}

#[test]
fn test_malformed_yaml_reports_text() {
    let err = compile_err("meta: [unclosed\n  id: x");
    assert!(!err.message.is_empty());
    assert!(err.message.starts_with("YAML"), "{}", err);
    assert!(!err.to_string().is_empty());
}

#[test]
fn test_missing_id() {
    let err = compile_err("seq:\n  - id: a\n    type: u1\n");
    assert!(err.message.contains("meta/id"), "{}", err);
}

#[test]
fn test_unknown_type() {
    let err = compile_err("meta:\n  id: t\nseq:\n  - id: a\n    type: nope\n");
    assert!(err.message.contains("unknown type `nope`"), "{}", err);
    assert!(err.message.contains("seq[0] (a)"), "{}", err);
}

#[test]
fn test_unknown_enum_and_enum_label() {
    let err = compile_err("meta:\n  id: t\nseq:\n  - id: a\n    type: u1\n    enum: missing\n");
    assert!(err.message.contains("unknown enum `missing`"), "{}", err);
    let err = compile_err(
        "meta:\n  id: t\nseq:\n  - id: a\n    type: u1\n    if: a == e::nope\nenums:\n  e:\n    1: one\n",
    );
    assert!(err.message.contains("e::nope"), "{}", err);
}

#[test]
fn test_bad_expression() {
    let err = compile_err("meta:\n  id: t\nseq:\n  - id: a\n    size: 1 +\n");
    assert!(err.message.contains("cannot parse expression"), "{}", err);
}

#[test]
fn test_unsupported_features() {
    let err = compile_err("meta:\n  id: t\n  imports:\n    - other\n");
    assert!(err.message.contains("imports"), "{}", err);

    let err = compile_err(
        "meta:\n  id: t\n  endian:\n    switch-on: x\n    cases:\n      1: le\nseq: []\n",
    );
    assert!(err.message.contains("switchable default endianness"), "{}", err);

    let err = compile_err("meta:\n  id: t\nseq:\n  - id: a\n    size: 4\n    process: zlib\n");
    assert!(err.message.contains("process `zlib` is not supported"), "{}", err);
}

#[test]
fn test_missing_endianness() {
    let err = compile_err("meta:\n  id: t\nseq:\n  - id: a\n    type: u4\n");
    assert!(err.message.contains("endianness"), "{}", err);
    // single bytes and explicit suffixes need no default
    assert!(compile_str("t", "meta:\n  id: t\nseq:\n  - id: a\n    type: u1\n  - id: b\n    type: s4be\n").is_ok());
}

#[test]
fn test_duplicate_ids() {
    let err = compile_err("meta:\n  id: t\nseq:\n  - id: a\n    type: u1\n  - id: a\n    type: u1\n");
    assert!(err.message.contains("duplicate id `a`"), "{}", err);
}

#[test]
fn test_parameter_defaults() {
    let def = compile_str(
        "p",
        r#"
meta:
  id: p
params:
  - id: count
    type: u4
  - id: ratio
    type: f8
  - id: strict
    type: bool
  - id: label
    type: str
  - id: blob
    type: bytes
  - id: other
    type: some_type
seq: []
"#,
    )
    .expect("compile");
    assert_eq!(
        def.param_names(),
        vec!["count", "ratio", "strict", "label", "blob", "other"]
    );
    assert_eq!(def.params()[0].ty, ParamType::Int);
    assert_eq!(
        def.default_arguments(),
        vec![
            Value::I64(0),
            Value::Double(0.0),
            Value::Bool(false),
            Value::Str(String::new()),
            Value::Bytes(Vec::new()),
            Value::Null,
        ]
    );
}

#[test]
fn test_load_str_is_cached_by_content() {
    let loader = SchemaLoader::default();
    let a = loader.load_str("header", HEADER).expect("load");
    let b = loader.load_str("header", HEADER).expect("load");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(loader.cached_len(), 1);
    let edited = HEADER.replace("1: data", "1: payload");
    let c = loader.load_str("header", &edited).expect("load");
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(loader.cached_len(), 2);
    assert_eq!(loader.invalidate("memory:header"), 2);
    assert_eq!(loader.cached_len(), 0);
}

#[test]
fn test_load_file_and_invalidate() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("header.ksy");
    std::fs::write(&path, HEADER).expect("write");
    let uri = path.to_str().expect("utf-8 path");

    let loader = SchemaLoader::default();
    let first = loader.load(uri).expect("load");
    assert!(first.identity.uri.starts_with("file://"));
    let again = loader.load(uri).expect("load");
    assert!(Arc::ptr_eq(&first, &again));

    std::fs::write(&path, HEADER.replace("type: u2", "type: u4")).expect("rewrite");
    let changed = loader.load(uri).expect("load");
    assert!(!Arc::ptr_eq(&first, &changed));
    assert_ne!(first.identity.digest, changed.identity.digest);
    assert_eq!(changed.root().seq[1].read.type_name(&changed), "u4le");

    assert_eq!(loader.invalidate(uri), 2);
    assert_eq!(loader.cached_len(), 0);
}

#[test]
fn test_file_url_and_path_share_identity() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("header.ksy");
    std::fs::write(&path, HEADER).expect("write");
    let url = url::Url::from_file_path(path.canonicalize().expect("canonicalize")).expect("url");

    let loader = SchemaLoader::default();
    let by_path = loader.load(path.to_str().expect("utf-8 path")).expect("load");
    let by_url = loader.load(url.as_str()).expect("load");
    assert!(Arc::ptr_eq(&by_path, &by_url));
}

#[test]
fn test_same_file_name_in_two_directories() {
    let one = TempDir::new().expect("tempdir");
    let two = TempDir::new().expect("tempdir");
    let a = one.path().join("fmt.ksy");
    let b = two.path().join("fmt.ksy");
    std::fs::write(&a, HEADER).expect("write");
    std::fs::write(&b, HEADER).expect("write");

    let loader = SchemaLoader::default();
    let da = loader.load(a.to_str().expect("utf-8")).expect("load");
    let db = loader.load(b.to_str().expect("utf-8")).expect("load");
    assert_ne!(da.identity, db.identity);
    assert_eq!(loader.cached_len(), 2);
}

#[test]
fn test_missing_file_is_resource_error() {
    let dir = TempDir::new().expect("tempdir");
    let loader = SchemaLoader::default();
    let err = loader
        .load(dir.path().join("absent.ksy").to_str().expect("utf-8"))
        .expect_err("missing file");
    assert!(matches!(err, LoadError::Resource { .. }), "{:?}", err);
}

#[test]
fn test_unsupported_scheme() {
    let loader = SchemaLoader::default();
    let err = loader.load("https://example.com/x.ksy").expect_err("scheme");
    assert!(matches!(err, LoadError::InvalidUri(_)), "{:?}", err);
}

#[test]
fn test_compile_failure_not_cached() {
    let loader = SchemaLoader::default();
    let err = loader.load_str("bad", "meta: [").expect_err("bad yaml");
    assert!(matches!(err, LoadError::Compile(_)));
    assert_eq!(loader.cached_len(), 0);
}

#[test]
fn test_compiler_version_is_forwarded() {
    let config = LoaderConfig {
        compiler_version: "0.10-test".to_string(),
        ..LoaderConfig::default()
    };
    let loader = SchemaLoader::new(config);
    let def = loader.load_str("header", HEADER).expect("load");
    assert_eq!(def.compiler_version, "0.10-test");
}

#[test]
fn test_config_from_yaml() {
    let config = LoaderConfig::from_yaml("retry:\n  attempts: 3\n  interval_ms: 250\n").expect("yaml");
    assert_eq!(config.retry.attempts, 3);
    assert_eq!(config.retry.interval(), Duration::from_millis(250));
    assert_eq!(config.compiler_version, LoaderConfig::default().compiler_version);
}

/// Reports `Pending` a fixed number of times before producing output.
struct SlowCompiler {
    pending: AtomicU32,
    calls: Arc<AtomicU32>,
}

impl SchemaCompiler for SlowCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.pending.load(Ordering::SeqCst);
        if left > 0 {
            self.pending.store(left - 1, Ordering::SeqCst);
            return Ok(CompileOutput::Pending);
        }
        KsyCompiler.compile_definition(request).map(CompileOutput::Ready)
    }
}

#[test]
fn test_pending_output_is_polled() {
    let calls = Arc::new(AtomicU32::new(0));
    let compiler = SlowCompiler {
        pending: AtomicU32::new(3),
        calls: Arc::clone(&calls),
    };
    let loader = SchemaLoader::with_compiler(fast_retry(5), Box::new(compiler));
    let def = loader.load_str("header", HEADER).expect("load after polling");
    assert_eq!(def.id, "header");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_retries_exhausted() {
    let calls = Arc::new(AtomicU32::new(0));
    let compiler = SlowCompiler {
        pending: AtomicU32::new(u32::MAX),
        calls: Arc::clone(&calls),
    };
    let loader = SchemaLoader::with_compiler(fast_retry(2), Box::new(compiler));
    let err = loader.load_str("header", HEADER).expect_err("no output");
    match err {
        LoadError::Compile(e) => assert!(e.message.contains("no output"), "{}", e),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(loader.cached_len(), 0);
}

/// Counts compiles and holds each one long enough for concurrent loads to overlap.
struct CountingCompiler {
    calls: Arc<AtomicU32>,
}

impl SchemaCompiler for CountingCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        KsyCompiler.compile(request)
    }
}

#[test]
fn test_concurrent_loads_compile_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let loader = SchemaLoader::with_compiler(
        LoaderConfig::default(),
        Box::new(CountingCompiler {
            calls: Arc::clone(&calls),
        }),
    );
    let defs: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| loader.load_str("header", HEADER).expect("load")))
            .collect();
        handles.into_iter().map(|h| h.join().expect("join")).collect()
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(defs.iter().all(|d| Arc::ptr_eq(d, &defs[0])));
}

struct PanicOnceCompiler {
    calls: AtomicU32,
}

impl SchemaCompiler for PanicOnceCompiler {
    fn compile(&self, request: &CompileRequest) -> Result<CompileOutput, CompileError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("compiler crashed");
        }
        KsyCompiler.compile(request)
    }
}

#[test]
fn test_compiler_panic_does_not_block_later_loads() {
    let loader = SchemaLoader::with_compiler(
        LoaderConfig::default(),
        Box::new(PanicOnceCompiler {
            calls: AtomicU32::new(0),
        }),
    );
    let crashed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        loader.load_str("header", HEADER)
    }));
    assert!(crashed.is_err());
    assert_eq!(loader.cached_len(), 0);

    let def = loader.load_str("header", HEADER).expect("load after crash");
    assert_eq!(def.id, "header");
    assert_eq!(loader.cached_len(), 1);
}
