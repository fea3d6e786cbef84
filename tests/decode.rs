//! Decoding engine tests: ranges, conditionals, repeats, switches, strings, enums,
//! instances, parameters, error paths, cancellation, idempotence and containment.

use std::sync::Arc;

use ksinspect::engine::{FieldData, FieldRecord, ObjId};
use ksinspect::expr::ExprError;
use ksinspect::stream::StreamError;
use ksinspect::{
    compile_str, decode, ByteSource, CancelToken, DecodeError, DecodeErrorKind, DecodeOptions,
    DecodedTree, Value,
};

fn run_with(src: &str, data: &[u8], options: &DecodeOptions) -> Result<DecodedTree, DecodeError> {
    let def = Arc::new(compile_str("t", src).expect("compile"));
    decode(&def, ByteSource::new(&data), options)
}

fn run(src: &str, data: &[u8]) -> Result<DecodedTree, DecodeError> {
    run_with(src, data, &DecodeOptions::default())
}

fn scalar<'a>(tree: &'a DecodedTree, obj: ObjId, name: &str) -> &'a Value {
    match &tree.field(obj, name).expect(name).data {
        FieldData::Scalar(v) => v,
        other => panic!("{} is not a scalar: {:?}", name, other),
    }
}

fn child(tree: &DecodedTree, obj: ObjId, name: &str) -> ObjId {
    match &tree.field(obj, name).expect(name).data {
        FieldData::Struct(id) => *id,
        other => panic!("{} is not a struct: {:?}", name, other),
    }
}

fn items<'a>(tree: &'a DecodedTree, obj: ObjId, name: &str) -> &'a [FieldRecord] {
    match &tree.field(obj, name).expect(name).data {
        FieldData::Array(items) => items,
        other => panic!("{} is not an array: {:?}", name, other),
    }
}

fn range(tree: &DecodedTree, obj: ObjId, name: &str) -> (u64, u64) {
    tree.field(obj, name).expect(name).range.expect("range")
}

const SINGLE_BYTE: &str = "
meta:
  id: t
seq:
  - id: x
    type: u1
";

#[test]
fn test_single_byte_scenario() {
    let tree = run(SINGLE_BYTE, &[0xFF]).expect("decode");
    let rec = tree.field(ObjId::ROOT, "x").expect("x");
    assert_eq!(rec.data, FieldData::Scalar(Value::U8(255)));
    assert_eq!(rec.type_name, "u1");
    assert_eq!(rec.range, Some((0, 1)));
    assert_eq!(tree.range(), (0, 1));
}

#[test]
fn test_single_byte_on_empty_input() {
    let err = run(SINGLE_BYTE, &[]).expect_err("empty input");
    assert_eq!(err.path, "t.x");
    assert!(matches!(
        err.kind,
        DecodeErrorKind::Stream(StreamError::EndOfStream { needed: 1, available: 0, .. })
    ));
}

const CONDITIONAL: &str = "
meta:
  id: t
seq:
  - id: a
    type: u1
  - id: b
    type: u1
    if: a == 1
  - id: c
    type: u1
";

#[test]
fn test_conditional_field_is_skipped() {
    let tree = run(CONDITIONAL, &[0, 7]).expect("decode");
    let names: Vec<_> = tree.object(ObjId::ROOT).fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);
    assert_eq!(scalar(&tree, ObjId::ROOT, "c"), &Value::U8(7));
    assert_eq!(range(&tree, ObjId::ROOT, "c"), (1, 2));

    let tree = run(CONDITIONAL, &[1, 5, 7]).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "b"), &Value::U8(5));
    assert_eq!(range(&tree, ObjId::ROOT, "c"), (2, 3));
}

#[test]
fn test_repeats() {
    let src = "
meta:
  id: t
  endian: be
seq:
  - id: n
    type: u1
  - id: words
    type: u2
    repeat: expr
    repeat-expr: n
  - id: terms
    type: u1
    repeat: until
    repeat-until: _ == 0
  - id: rest
    type: u1
    repeat: eos
";
    let tree = run(src, &[2, 0, 1, 0, 2, 5, 6, 0, 9, 9]).expect("decode");
    let words = items(&tree, ObjId::ROOT, "words");
    assert_eq!(words.len(), 2);
    assert_eq!(words[1].name, "[1]");
    assert_eq!(words[1].data, FieldData::Scalar(Value::U16(2)));
    assert_eq!(words[1].range, Some((3, 5)));
    assert_eq!(tree.field(ObjId::ROOT, "words").unwrap().type_name, "u2be[]");
    assert_eq!(range(&tree, ObjId::ROOT, "words"), (1, 5));
    assert_eq!(items(&tree, ObjId::ROOT, "terms").len(), 3);
    assert_eq!(range(&tree, ObjId::ROOT, "terms"), (5, 8));
    assert_eq!(items(&tree, ObjId::ROOT, "rest").len(), 2);
    assert_eq!(range(&tree, ObjId::ROOT, "rest"), (8, 10));
}

#[test]
fn test_repeat_expr_zero_gives_empty_array() {
    let src = "
meta:
  id: t
seq:
  - id: n
    type: u1
  - id: xs
    type: u1
    repeat: expr
    repeat-expr: n
";
    let tree = run(src, &[0]).expect("decode");
    assert!(items(&tree, ObjId::ROOT, "xs").is_empty());
    assert_eq!(range(&tree, ObjId::ROOT, "xs"), (1, 1));
}

const SWITCH: &str = "
meta:
  id: t
  endian: le
seq:
  - id: tag
    type: u1
  - id: body
    type:
      switch-on: tag
      cases:
        1: u2
        2: point
        _: u1
types:
  point:
    seq:
      - id: x
        type: u1
      - id: y
        type: u1
";

#[test]
fn test_switch_cases_and_default() {
    let tree = run(SWITCH, &[1, 0x34, 0x12]).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "body"), &Value::U16(0x1234));
    assert_eq!(tree.field(ObjId::ROOT, "body").unwrap().type_name, "u2le");

    let tree = run(SWITCH, &[2, 3, 4]).expect("decode");
    let point = child(&tree, ObjId::ROOT, "body");
    assert_eq!(tree.type_of(point).name, "point");
    assert_eq!(scalar(&tree, point, "y"), &Value::U8(4));
    assert_eq!(range(&tree, point, "y"), (2, 3));

    let tree = run(SWITCH, &[9, 7]).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "body"), &Value::U8(7));
}

#[test]
fn test_switch_without_match_is_null() {
    let src = "
meta:
  id: t
seq:
  - id: tag
    type: u1
  - id: body
    type:
      switch-on: tag
      cases:
        1: u1
";
    let tree = run(src, &[5]).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "body"), &Value::Null);
    assert_eq!(range(&tree, ObjId::ROOT, "body"), (1, 1));
}

#[test]
fn test_enums() {
    let src = "
meta:
  id: t
seq:
  - id: a
    type: u1
    enum: color
  - id: b
    type: u1
    enum: color
  - id: is_green
    type: u1
    if: a == color::green
enums:
  color:
    1: red
    2: green
";
    let tree = run(src, &[2, 9, 1]).expect("decode");
    match scalar(&tree, ObjId::ROOT, "a") {
        Value::Enum { name, value, label, .. } => {
            assert_eq!(name, "color");
            assert_eq!(*value, 2);
            assert_eq!(label.as_deref(), Some("green"));
        }
        other => panic!("not an enum: {:?}", other),
    }
    assert!(matches!(
        scalar(&tree, ObjId::ROOT, "b"),
        Value::Enum { value: 9, label: None, .. }
    ));
    assert!(tree.field(ObjId::ROOT, "is_green").is_some());
}

#[test]
fn test_strings_and_processing() {
    let src = "
meta:
  id: t
  encoding: ASCII
seq:
  - id: name
    type: strz
  - id: fixed
    type: str
    size: 6
    pad-right: 0x20
  - id: padded
    type: str
    size: 5
    terminator: 0
  - id: raw
    size: 2
    process: xor(0xff)
";
    let mut data = b"hi\0ab    xy\0zz".to_vec();
    data.extend_from_slice(&[0xfe, 0x0f]);
    let tree = run(src, &data).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "name"), &Value::Str("hi".into()));
    assert_eq!(range(&tree, ObjId::ROOT, "name"), (0, 3));
    assert_eq!(scalar(&tree, ObjId::ROOT, "fixed"), &Value::Str("ab".into()));
    assert_eq!(range(&tree, ObjId::ROOT, "fixed"), (3, 9));
    assert_eq!(scalar(&tree, ObjId::ROOT, "padded"), &Value::Str("xy".into()));
    assert_eq!(range(&tree, ObjId::ROOT, "padded"), (9, 14));
    assert_eq!(scalar(&tree, ObjId::ROOT, "raw"), &Value::Bytes(vec![0x01, 0xf0]));
    assert_eq!(range(&tree, ObjId::ROOT, "raw"), (14, 16));
}

#[test]
fn test_bit_fields() {
    let src = "
meta:
  id: t
seq:
  - id: flag
    type: b1
  - id: level
    type: b3
  - id: rest
    type: b4
  - id: byte
    type: u1
";
    let tree = run(src, &[0b1011_0110, 0x42]).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "flag"), &Value::Bool(true));
    assert_eq!(scalar(&tree, ObjId::ROOT, "level"), &Value::U8(3));
    assert_eq!(scalar(&tree, ObjId::ROOT, "rest"), &Value::U8(6));
    assert_eq!(range(&tree, ObjId::ROOT, "byte"), (1, 2));
}

#[test]
fn test_bit_fields_repeat_to_end_of_stream() {
    let src = "
meta:
  id: t
seq:
  - id: flags
    type: b1
    repeat: eos
";
    let tree = run(src, &[0xA0]).expect("decode");
    let flags = items(&tree, ObjId::ROOT, "flags");
    assert_eq!(flags.len(), 8);
    assert_eq!(flags[0].data, FieldData::Scalar(Value::Bool(true)));
    assert_eq!(flags[1].data, FieldData::Scalar(Value::Bool(false)));
    assert_eq!(flags[2].data, FieldData::Scalar(Value::Bool(true)));
    assert_eq!(range(&tree, ObjId::ROOT, "flags"), (0, 1));
}

#[test]
fn test_index_in_size_expression() {
    let src = "
meta:
  id: t
seq:
  - id: lens
    type: u1
    repeat: expr
    repeat-expr: 2
  - id: blobs
    size: lens[_index]
    repeat: expr
    repeat-expr: 2
";
    let tree = run(src, &[1, 2, 0xaa, 0xbb, 0xcc]).expect("decode");
    let blobs = items(&tree, ObjId::ROOT, "blobs");
    assert_eq!(blobs[0].data, FieldData::Scalar(Value::Bytes(vec![0xaa])));
    assert_eq!(blobs[0].range, Some((2, 3)));
    assert_eq!(blobs[1].data, FieldData::Scalar(Value::Bytes(vec![0xbb, 0xcc])));
    assert_eq!(blobs[1].range, Some((3, 5)));
}

#[test]
fn test_index_in_arguments_and_process() {
    let src = "
meta:
  id: t
seq:
  - id: rows
    type: row(_index + 1)
    repeat: expr
    repeat-expr: 2
  - id: keyed
    size: 1
    process: xor(_index)
    repeat: expr
    repeat-expr: 3
types:
  row:
    params:
      - id: w
        type: u1
    seq:
      - id: cells
        size: w
";
    let tree = run(src, &[9, 8, 7, 5, 5, 5]).expect("decode");
    let rows = items(&tree, ObjId::ROOT, "rows");
    assert_eq!(rows[0].range, Some((0, 1)));
    assert_eq!(rows[1].range, Some((1, 3)));
    let FieldData::Struct(second) = rows[1].data else {
        panic!("row is not a struct");
    };
    assert_eq!(scalar(&tree, second, "cells"), &Value::Bytes(vec![8, 7]));

    let keyed: Vec<_> = items(&tree, ObjId::ROOT, "keyed")
        .iter()
        .map(|r| r.data.clone())
        .collect();
    assert_eq!(
        keyed,
        vec![
            FieldData::Scalar(Value::Bytes(vec![5])),
            FieldData::Scalar(Value::Bytes(vec![4])),
            FieldData::Scalar(Value::Bytes(vec![7])),
        ]
    );
}

#[test]
fn test_enum_field_with_validation() {
    let src = "
meta:
  id: t
seq:
  - id: kind
    type: u1
    enum: kind
    valid:
      any-of: [kind::a, kind::b]
enums:
  kind:
    1: a
    2: b
";
    assert!(matches!(
        run(src, &[2]).expect("decode").field(ObjId::ROOT, "kind").expect("kind").data,
        FieldData::Scalar(Value::Enum { value: 2, .. })
    ));
    let err = run(src, &[3]).expect_err("not allowed");
    assert_eq!(err.path, "t.kind");
    assert!(matches!(err.kind, DecodeErrorKind::Validation(_)));
}

#[test]
fn test_contents_mismatch_is_validation_error() {
    let src = "
meta:
  id: t
seq:
  - id: magic
    contents: KS
";
    assert!(run(src, b"KS").is_ok());
    let err = run(src, b"KX").expect_err("bad magic");
    assert_eq!(err.path, "t.magic");
    assert!(matches!(err.kind, DecodeErrorKind::Validation(_)), "{}", err);
}

#[test]
fn test_valid_constraints() {
    let src = "
meta:
  id: t
seq:
  - id: v
    type: u1
    valid:
      min: 1
      max: 3
  - id: w
    type: u1
    valid:
      any-of: [10, 20]
";
    assert!(run(src, &[2, 20]).is_ok());
    let err = run(src, &[5, 20]).expect_err("out of range");
    assert_eq!(err.path, "t.v");
    assert!(matches!(err.kind, DecodeErrorKind::Validation(_)));
    let err = run(src, &[1, 11]).expect_err("not allowed");
    assert_eq!(err.path, "t.w");
}

const ITEMS: &str = "
meta:
  id: t
  endian: be
seq:
  - id: count
    type: u1
  - id: items
    type: item
    repeat: expr
    repeat-expr: count
types:
  item:
    seq:
      - id: v
        type: u2
";

#[test]
fn test_error_path_names_array_element() {
    let err = run(ITEMS, &[3, 0, 1, 0, 2, 0]).expect_err("truncated");
    assert_eq!(err.path, "t.items[2].v");
    assert_eq!(
        err.kind,
        DecodeErrorKind::Stream(StreamError::EndOfStream {
            pos: 5,
            needed: 2,
            available: 1
        })
    );
    assert!(err.to_string().starts_with("t.items[2].v: "));
}

#[test]
fn test_sized_substream_bounds_user_type() {
    let src = "
meta:
  id: t
  endian: be
seq:
  - id: inner
    type: inner
    size: 2
  - id: after
    type: u1
types:
  inner:
    seq:
      - id: x
        type: u4
";
    let err = run(src, &[0, 0, 0, 0, 1]).expect_err("bounded");
    assert_eq!(err.path, "t.inner.x");
    assert!(matches!(
        err.kind,
        DecodeErrorKind::Stream(StreamError::EndOfStream { available: 2, .. })
    ));
}

#[test]
fn test_special_names() {
    let src = "
meta:
  id: t
seq:
  - id: len
    type: u1
  - id: inner
    type: inner
    size: 3
  - id: remaining
    size: _io.size - _io.pos
types:
  inner:
    seq:
      - id: a
        size: _parent.len
      - id: b
        size: _io.size - _io.pos
      - id: big
        type: u1
        if: _root.len > 100
";
    let tree = run(src, &[2, 10, 11, 12, 20, 21]).expect("decode");
    let inner = child(&tree, ObjId::ROOT, "inner");
    assert_eq!(range(&tree, ObjId::ROOT, "inner"), (1, 4));
    assert_eq!(scalar(&tree, inner, "a"), &Value::Bytes(vec![10, 11]));
    assert_eq!(scalar(&tree, inner, "b"), &Value::Bytes(vec![12]));
    assert!(tree.field(inner, "big").is_none());
    assert_eq!(scalar(&tree, ObjId::ROOT, "remaining"), &Value::Bytes(vec![20, 21]));
    assert_eq!(range(&tree, ObjId::ROOT, "remaining"), (4, 6));
}

#[test]
fn test_parameters() {
    let src = "
meta:
  id: t
params:
  - id: width
    type: u1
seq:
  - id: rows
    type: row(width)
    repeat: expr
    repeat-expr: 2
types:
  row:
    params:
      - id: w
        type: u1
    seq:
      - id: cells
        size: w
";
    let options = DecodeOptions {
        arguments: vec![Value::U8(3)],
        ..DecodeOptions::default()
    };
    let tree = run_with(src, &[1, 2, 3, 4, 5, 6], &options).expect("decode");
    let rows = items(&tree, ObjId::ROOT, "rows");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].range, Some((3, 6)));
    let FieldData::Struct(second) = rows[1].data else {
        panic!("row is not a struct");
    };
    assert_eq!(scalar(&tree, second, "cells"), &Value::Bytes(vec![4, 5, 6]));

    // without arguments the parameter takes its zero value
    let tree = run(src, &[1, 2, 3]).expect("decode");
    assert_eq!(range(&tree, ObjId::ROOT, "rows"), (0, 0));
}

const INSTANCES: &str = "
meta:
  id: t
seq:
  - id: ofs
    type: u1
  - id: len
    type: u1
instances:
  total:
    value: ofs + len
  tail:
    pos: ofs
    size: len
  first_of_tail:
    value: tail[0]
";

#[test]
fn test_instances_are_lazy() {
    let data = [4u8, 2, 0xaa, 0xbb, 0xcc, 0xdd];
    let mut tree = run(INSTANCES, &data).expect("decode");
    let ty = tree.type_of(ObjId::ROOT);
    let tail = ty.instance_index("tail").expect("tail");
    assert!(tree.instance(ObjId::ROOT, tail).is_none());

    let total = tree.instance_by_name(&data, ObjId::ROOT, "total").expect("total");
    assert_eq!(total.data, FieldData::Scalar(Value::I64(6)));
    assert_eq!(total.range, None);

    let first = tree
        .instance_by_name(&data, ObjId::ROOT, "first_of_tail")
        .expect("first")
        .clone();
    assert_eq!(first.data, FieldData::Scalar(Value::I64(0xcc)));
    // evaluating `first_of_tail` forced `tail`
    let rec = tree.instance(ObjId::ROOT, tail).expect("tail evaluated");
    assert_eq!(rec.data, FieldData::Scalar(Value::Bytes(vec![0xcc, 0xdd])));
    assert_eq!(rec.range, Some((4, 6)));
}

#[test]
fn test_instance_used_by_seq_is_evaluated_during_decode() {
    let src = "
meta:
  id: t
seq:
  - id: n
    type: u1
  - id: body
    size: double_n
instances:
  double_n:
    value: n * 2
";
    let tree = run(src, &[2, 1, 2, 3, 4]).expect("decode");
    assert_eq!(scalar(&tree, ObjId::ROOT, "body"), &Value::Bytes(vec![1, 2, 3, 4]));
    assert!(tree.instance(ObjId::ROOT, 0).is_some());
}

#[test]
fn test_instance_failure_is_reported_and_retryable() {
    let src = "
meta:
  id: t
seq:
  - id: ofs
    type: u1
instances:
  far:
    pos: ofs
    type: u1
";
    let data = [9u8];
    let mut tree = run(src, &data).expect("decode");
    let err = tree.instance_by_name(&data, ObjId::ROOT, "far").expect_err("seek");
    assert_eq!(err.path, "far");
    assert!(matches!(
        err.kind,
        DecodeErrorKind::Stream(StreamError::SeekOutOfRange { pos: 9, size: 1 })
    ));
    assert!(tree.instance(ObjId::ROOT, 0).is_none());
}

#[test]
fn test_instance_cycle_is_an_error() {
    let src = "
meta:
  id: t
instances:
  a:
    value: b + 1
  b:
    value: a + 1
";
    let mut tree = run(src, &[]).expect("decode");
    let err = tree.instance_by_name(&[0u8; 0], ObjId::ROOT, "a").expect_err("cycle");
    assert_eq!(err.path, "a.b");
    assert_eq!(err.kind, DecodeErrorKind::Expression(ExprError::Cycle("a".into())));
}

#[test]
fn test_cancelled_decode() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let options = DecodeOptions {
        cancel,
        ..DecodeOptions::default()
    };
    let err = run_with(ITEMS, &[1, 0, 1], &options).expect_err("cancelled");
    assert!(err.is_cancelled());
    assert_eq!(err.path, "t.count");
}

#[test]
fn test_decode_is_idempotent() {
    let data = [3u8, 0, 1, 0, 2, 0, 3];
    let a = run(ITEMS, &data).expect("decode");
    let b = run(ITEMS, &data).expect("decode");
    assert_eq!(a.object_count(), b.object_count());
    for i in 0..a.object_count() {
        assert_eq!(a.object(ObjId(i)).fields, b.object(ObjId(i)).fields);
    }
}

fn assert_contained(records: &[FieldRecord], outer: (u64, u64)) {
    let mut last_end = outer.0;
    for rec in records {
        let Some((start, end)) = rec.range else { continue };
        assert!(start <= end, "{}: inverted range", rec.name);
        assert!(start >= outer.0 && end <= outer.1, "{} escapes {:?}", rec.name, outer);
        assert!(start >= last_end, "{} overlaps its previous sibling", rec.name);
        last_end = end;
        if let FieldData::Array(items) = &rec.data {
            assert_contained(items, (start, end));
        }
    }
}

#[test]
fn test_ranges_are_contained_and_disjoint() {
    let data = [3u8, 0, 1, 0, 2, 0, 3];
    let tree = run(ITEMS, &data).expect("decode");
    assert_contained(&tree.object(ObjId::ROOT).fields, tree.range());
    for i in 1..tree.object_count() {
        let obj = tree.object(ObjId(i));
        assert_contained(&obj.fields, (obj.start, obj.end));
    }

    let tree = run(SWITCH, &[2, 3, 4]).expect("decode");
    let point = child(&tree, ObjId::ROOT, "body");
    assert_contained(&tree.object(point).fields, range(&tree, ObjId::ROOT, "body"));
}
