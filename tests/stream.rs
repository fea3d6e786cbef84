//! Byte source tests: widths, byte order, end-of-stream boundaries, terminators, bits,
//! substreams, and the read-only contract.

use ksinspect::stream::{BinaryData, ByteSource, Endianness, IoWindow, StreamError};

#[test]
fn test_read_unsigned_both_orders() {
    let data = [0x12u8, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0];
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_unsigned(2, Endianness::Big).unwrap(), 0x1234);
    assert_eq!(s.read_unsigned(2, Endianness::Little).unwrap(), 0x7856);
    assert_eq!(s.position(), 4);
    s.seek(0).unwrap();
    assert_eq!(s.read_unsigned(4, Endianness::Big).unwrap(), 0x1234_5678);
    s.seek(0).unwrap();
    assert_eq!(s.read_unsigned(8, Endianness::Little).unwrap(), 0xf0de_bc9a_7856_3412);
    assert!(s.is_at_end());
}

#[test]
fn test_endianness_law() {
    let data = [0x01u8, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
    for width in [2usize, 4, 8] {
        let bytes = &data[..width];
        let mut reversed = bytes.to_vec();
        reversed.reverse();
        let be = ByteSource::new(&bytes).read_unsigned(width, Endianness::Big).unwrap();
        let le = ByteSource::new(&reversed).read_unsigned(width, Endianness::Little).unwrap();
        assert_eq!(be, le, "width {}", width);
    }
}

#[test]
fn test_read_signed_twos_complement() {
    let data = [0xffu8, 0xff, 0xfe, 0x80, 0x00, 0x00, 0x00];
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_signed(1, Endianness::Big).unwrap(), -1);
    assert_eq!(s.read_signed(2, Endianness::Big).unwrap(), -2);
    assert_eq!(s.read_signed(4, Endianness::Big).unwrap(), i32::MIN as i64);
}

#[test]
fn test_read_floats() {
    let mut data = 1.5f32.to_be_bytes().to_vec();
    data.extend_from_slice(&(-2.25f64).to_le_bytes());
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_float(4, Endianness::Big).unwrap(), 1.5);
    assert_eq!(s.read_float(8, Endianness::Little).unwrap(), -2.25);
}

#[test]
fn test_unsupported_width() {
    let data = [0u8; 8];
    let mut s = ByteSource::new(&data);
    assert_eq!(
        s.read_unsigned(3, Endianness::Big),
        Err(StreamError::UnsupportedWidth(3))
    );
    assert_eq!(
        s.read_float(2, Endianness::Big),
        Err(StreamError::UnsupportedWidth(2))
    );
}

#[test]
fn test_end_of_stream_boundary() {
    let data = [1u8, 2, 3, 4, 5];
    let mut s = ByteSource::new(&data);
    s.seek(1).unwrap();
    // p + width == size is allowed
    assert_eq!(s.read_unsigned(4, Endianness::Big).unwrap(), 0x0203_0405);
    s.seek(2).unwrap();
    let err = s.read_unsigned(4, Endianness::Big).unwrap_err();
    assert_eq!(
        err,
        StreamError::EndOfStream {
            pos: 2,
            needed: 4,
            available: 3
        }
    );
    // failed read leaves the cursor alone
    assert_eq!(s.position(), 2);
}

#[test]
fn test_seek_out_of_range() {
    let data = [0u8; 4];
    let mut s = ByteSource::new(&data);
    assert!(s.seek(4).is_ok());
    assert!(s.is_at_end());
    assert_eq!(s.seek(5), Err(StreamError::SeekOutOfRange { pos: 5, size: 4 }));
}

#[test]
fn test_read_until_stops_after_terminator() {
    let data = [0x41u8, 0x42, 0x00, 0x43];
    let mut s = ByteSource::new(&data);
    let got = s.read_until(&[0x00], false, true, true).unwrap();
    assert_eq!(got, vec![0x41, 0x42]);
    assert_eq!(s.position(), 3);
}

#[test]
fn test_read_until_include_and_no_consume() {
    let data = [0x41u8, 0x42, 0x00, 0x43];
    let mut s = ByteSource::new(&data);
    let got = s.read_until(&[0x00], true, false, true).unwrap();
    assert_eq!(got, vec![0x41, 0x42, 0x00]);
    assert_eq!(s.position(), 2);
}

#[test]
fn test_read_until_missing_terminator() {
    let data = [0x41u8, 0x42];
    let mut s = ByteSource::new(&data);
    assert!(matches!(
        s.read_until(&[0x00], false, true, true),
        Err(StreamError::MissingTerminator { .. })
    ));
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_until(&[0x00], false, true, false).unwrap(), vec![0x41, 0x42]);
    assert!(s.is_at_end());
}

#[test]
fn test_read_until_multibyte_terminator_is_unit_aligned() {
    // UTF-16 "A\0" followed by the 00 00 terminator; the 00 at odd offset 1 must not match
    let data = [0x41u8, 0x00, 0x00, 0x00, 0x42, 0x00];
    let mut s = ByteSource::new(&data);
    let got = s.read_until(&[0x00, 0x00], false, true, true).unwrap();
    assert_eq!(got, vec![0x41, 0x00]);
    assert_eq!(s.position(), 4);
}

#[test]
fn test_read_remaining_and_bytes() {
    let data = [1u8, 2, 3, 4, 5];
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_bytes(2).unwrap(), vec![1, 2]);
    assert_eq!(s.read_remaining().unwrap(), vec![3, 4, 5]);
    assert_eq!(s.read_remaining().unwrap(), Vec::<u8>::new());
    assert!(s.read_bytes(1).is_err());
}

#[test]
fn test_bits_big_endian() {
    // 1011 0010 0111 1111
    let data = [0b1011_0010u8, 0b0111_1111];
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_bits_int_be(1).unwrap(), 1);
    assert_eq!(s.read_bits_int_be(3).unwrap(), 0b011);
    assert_eq!(s.read_bits_int_be(8).unwrap(), 0b0010_0111);
    assert_eq!(s.read_bits_int_be(4).unwrap(), 0b1111);
    assert!(s.is_at_end());
}

#[test]
fn test_bits_little_endian() {
    let data = [0b1011_0010u8];
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_bits_int_le(4).unwrap(), 0b0010);
    assert_eq!(s.read_bits_int_le(4).unwrap(), 0b1011);
}

#[test]
fn test_byte_read_after_bits_aligns() {
    let data = [0xffu8, 0x2a];
    let mut s = ByteSource::new(&data);
    assert_eq!(s.read_bits_int_be(3).unwrap(), 0b111);
    assert_eq!(s.read_unsigned(1, Endianness::Big).unwrap(), 0x2a);
    assert_eq!(s.read_bits_int_be(65), Err(StreamError::TooManyBits(65)));
}

#[test]
fn test_substream_is_bounded_and_absolute() {
    let data = [9u8, 1, 2, 3, 4, 5];
    let mut s = ByteSource::new(&data);
    s.seek(1).unwrap();
    let mut sub = s.substream(3).unwrap();
    assert_eq!(s.position(), 4);
    assert_eq!(sub.size(), 3);
    assert_eq!(sub.window(), IoWindow { base: 1, len: 3 });
    assert_eq!(sub.read_unsigned(2, Endianness::Big).unwrap(), 0x0102);
    assert_eq!(sub.absolute_position(), 3);
    assert!(matches!(
        sub.read_unsigned(2, Endianness::Big),
        Err(StreamError::EndOfStream { .. })
    ));
}

#[test]
fn test_with_window_rejects_overflow() {
    let data = [0u8; 4];
    assert!(ByteSource::with_window(&data, IoWindow { base: 2, len: 2 }).is_ok());
    assert!(ByteSource::with_window(&data, IoWindow { base: 3, len: 2 }).is_err());
}

#[test]
fn test_writes_are_unsupported() {
    let data = vec![0u8; 4];
    let mut s = ByteSource::new(&data);
    assert_eq!(
        s.write_bytes(&[1, 2]),
        Err(StreamError::UnsupportedOperation("write_bytes"))
    );
    assert!(matches!(
        s.write_unsigned(2, Endianness::Little, 7),
        Err(StreamError::UnsupportedOperation(_))
    ));
    assert_eq!(data.byte_at(0), 0);
}
