//! Read-only byte source: a seekable, bounded cursor over host-supplied binary data.
//!
//! Mirrors the stream contract generated parsers expect (fixed-width integers in both byte
//! orders, IEEE-754 floats, bit-level integers, terminator-delimited and remainder reads),
//! but never writes: every write entry point fails with [`StreamError::UnsupportedOperation`].
//!
//! A [`ByteSource`] borrows its [`BinaryData`] for the duration of a decode. Substreams
//! (`size:`-bounded user types, `io:` instances) are windows `[base, base + len)` over the
//! same data, so positions reported by [`ByteSource::absolute_position`] are always in the
//! coordinate space of the whole buffer.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte order for multi-byte reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    /// Suffix used in type names (`u4be`, `s2le`).
    pub fn suffix(self) -> &'static str {
        match self {
            Endianness::Big => "be",
            Endianness::Little => "le",
        }
    }
}

/// Random-access byte container supplied by the host (loaded file, editor buffer, selection).
///
/// The engine only reads through this trait and assumes the contents stay stable while a
/// decode is running.
pub trait BinaryData {
    /// Total number of bytes.
    fn size(&self) -> u64;

    /// Copy `buf.len()` bytes starting at `pos` into `buf`. Callers guarantee
    /// `pos + buf.len() <= size()`.
    fn copy_to(&self, pos: u64, buf: &mut [u8]);

    fn byte_at(&self, pos: u64) -> u8 {
        let mut b = [0u8; 1];
        self.copy_to(pos, &mut b);
        b[0]
    }
}

impl BinaryData for [u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn copy_to(&self, pos: u64, buf: &mut [u8]) {
        let start = pos as usize;
        buf.copy_from_slice(&self[start..start + buf.len()]);
    }

    fn byte_at(&self, pos: u64) -> u8 {
        self[pos as usize]
    }
}

impl BinaryData for Vec<u8> {
    fn size(&self) -> u64 {
        self.as_slice().size()
    }

    fn copy_to(&self, pos: u64, buf: &mut [u8]) {
        self.as_slice().copy_to(pos, buf)
    }

    fn byte_at(&self, pos: u64) -> u8 {
        self.as_slice().byte_at(pos)
    }
}

impl<const N: usize> BinaryData for [u8; N] {
    fn size(&self) -> u64 {
        N as u64
    }

    fn copy_to(&self, pos: u64, buf: &mut [u8]) {
        self.as_slice().copy_to(pos, buf)
    }
}

impl BinaryData for &[u8] {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn copy_to(&self, pos: u64, buf: &mut [u8]) {
        (**self).copy_to(pos, buf)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("end of stream at offset {pos}: needed {needed} byte(s), {available} available")]
    EndOfStream { pos: u64, needed: u64, available: u64 },
    #[error("end of stream reached, but no terminator {terminator} found")]
    MissingTerminator { terminator: String },
    #[error("seek to {pos} outside stream of size {size}")]
    SeekOutOfRange { pos: u64, size: u64 },
    #[error("unsupported read width: {0} byte(s)")]
    UnsupportedWidth(usize),
    #[error("bit-sized integer of {0} bits exceeds 64")]
    TooManyBits(u32),
    #[error("unsupported operation: {0} (byte source is read-only)")]
    UnsupportedOperation(&'static str),
}

/// A `[base, base + len)` window over the backing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoWindow {
    pub base: u64,
    pub len: u64,
}

/// Seekable read cursor over a window of [`BinaryData`].
#[derive(Clone)]
pub struct ByteSource<'a> {
    data: &'a dyn BinaryData,
    base: u64,
    len: u64,
    pos: u64,
    bits: u64,
    bits_left: u32,
}

impl std::fmt::Debug for ByteSource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteSource")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("pos", &self.pos)
            .field("bits_left", &self.bits_left)
            .finish()
    }
}

impl<'a> ByteSource<'a> {
    /// Cursor over the whole of `data`, positioned at 0.
    pub fn new(data: &'a dyn BinaryData) -> Self {
        ByteSource {
            data,
            base: 0,
            len: data.size(),
            pos: 0,
            bits: 0,
            bits_left: 0,
        }
    }

    /// Cursor over `window` of `data`; fails if the window does not fit.
    pub fn with_window(data: &'a dyn BinaryData, window: IoWindow) -> Result<Self, StreamError> {
        let size = data.size();
        if window.base > size || window.len > size - window.base {
            return Err(StreamError::EndOfStream {
                pos: window.base,
                needed: window.len,
                available: size.saturating_sub(window.base),
            });
        }
        Ok(ByteSource {
            data,
            base: window.base,
            len: window.len,
            pos: 0,
            bits: 0,
            bits_left: 0,
        })
    }

    pub fn data(&self) -> &'a dyn BinaryData {
        self.data
    }

    pub fn window(&self) -> IoWindow {
        IoWindow {
            base: self.base,
            len: self.len,
        }
    }

    /// Size of this (sub)stream in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Cursor relative to the start of this (sub)stream.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Cursor in the coordinate space of the whole backing buffer.
    pub fn absolute_position(&self) -> u64 {
        self.base + self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.bits_left == 0 && self.pos >= self.len
    }

    /// Bits of the current byte not yet consumed by a bit-integer read.
    pub fn bits_left(&self) -> u32 {
        self.bits_left
    }

    pub fn seek(&mut self, pos: u64) -> Result<(), StreamError> {
        self.align_to_byte();
        if pos > self.len {
            return Err(StreamError::SeekOutOfRange {
                pos,
                size: self.len,
            });
        }
        self.pos = pos;
        Ok(())
    }

    /// Drop any pending sub-byte state; the next read starts on a byte boundary.
    pub fn align_to_byte(&mut self) {
        self.bits = 0;
        self.bits_left = 0;
    }

    fn ensure(&self, needed: u64) -> Result<(), StreamError> {
        let available = self.len - self.pos;
        if needed > available {
            return Err(StreamError::EndOfStream {
                pos: self.absolute_position(),
                needed,
                available,
            });
        }
        Ok(())
    }

    fn read_not_aligned(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        self.ensure(buf.len() as u64)?;
        self.data.copy_to(self.base + self.pos, buf);
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], StreamError> {
        self.align_to_byte();
        let mut buf = [0u8; N];
        self.read_not_aligned(&mut buf)?;
        Ok(buf)
    }

    /// Unsigned integer of `width` bytes (1, 2, 4 or 8).
    pub fn read_unsigned(&mut self, width: usize, endian: Endianness) -> Result<u64, StreamError> {
        Ok(match (width, endian) {
            (1, _) => self.read_array::<1>()?[0] as u64,
            (2, Endianness::Big) => BigEndian::read_u16(&self.read_array::<2>()?) as u64,
            (2, Endianness::Little) => LittleEndian::read_u16(&self.read_array::<2>()?) as u64,
            (4, Endianness::Big) => BigEndian::read_u32(&self.read_array::<4>()?) as u64,
            (4, Endianness::Little) => LittleEndian::read_u32(&self.read_array::<4>()?) as u64,
            (8, Endianness::Big) => BigEndian::read_u64(&self.read_array::<8>()?),
            (8, Endianness::Little) => LittleEndian::read_u64(&self.read_array::<8>()?),
            _ => return Err(StreamError::UnsupportedWidth(width)),
        })
    }

    /// Two's-complement signed integer of `width` bytes, reinterpreted from the raw bits.
    pub fn read_signed(&mut self, width: usize, endian: Endianness) -> Result<i64, StreamError> {
        let raw = self.read_unsigned(width, endian)?;
        Ok(match width {
            1 => raw as u8 as i8 as i64,
            2 => raw as u16 as i16 as i64,
            4 => raw as u32 as i32 as i64,
            _ => raw as i64,
        })
    }

    pub fn read_f32(&mut self, endian: Endianness) -> Result<f32, StreamError> {
        let buf = self.read_array::<4>()?;
        Ok(match endian {
            Endianness::Big => BigEndian::read_f32(&buf),
            Endianness::Little => LittleEndian::read_f32(&buf),
        })
    }

    pub fn read_f64(&mut self, endian: Endianness) -> Result<f64, StreamError> {
        let buf = self.read_array::<8>()?;
        Ok(match endian {
            Endianness::Big => BigEndian::read_f64(&buf),
            Endianness::Little => LittleEndian::read_f64(&buf),
        })
    }

    /// IEEE-754 float of `width` bytes (4 or 8), widened to `f64`.
    pub fn read_float(&mut self, width: usize, endian: Endianness) -> Result<f64, StreamError> {
        match width {
            4 => Ok(self.read_f32(endian)? as f64),
            8 => self.read_f64(endian),
            _ => Err(StreamError::UnsupportedWidth(width)),
        }
    }

    /// Big-endian bit-sized integer (`b<n>` with `bit-endian: be`), MSB first.
    pub fn read_bits_int_be(&mut self, n: u32) -> Result<u64, StreamError> {
        if n > 64 {
            return Err(StreamError::TooManyBits(n));
        }
        let mut res: u64 = 0;
        let bits_needed = n as i32 - self.bits_left as i32;
        let new_bits_left = ((-bits_needed) & 7) as u32;
        if bits_needed > 0 {
            let bytes_needed = ((bits_needed - 1) / 8 + 1) as usize;
            let mut buf = [0u8; 8];
            self.read_not_aligned(&mut buf[..bytes_needed])?;
            for b in &buf[..bytes_needed] {
                res = (res << 8) | *b as u64;
            }
            let new_bits = res;
            res = (res >> new_bits_left)
                | if bits_needed < 64 {
                    self.bits << bits_needed
                } else {
                    0
                };
            self.bits = new_bits;
        } else {
            res = self.bits >> (-bits_needed);
        }
        self.bits_left = new_bits_left;
        self.bits &= (1u64 << self.bits_left) - 1;
        Ok(res)
    }

    /// Little-endian bit-sized integer (`bit-endian: le`), LSB first.
    pub fn read_bits_int_le(&mut self, n: u32) -> Result<u64, StreamError> {
        if n > 64 {
            return Err(StreamError::TooManyBits(n));
        }
        let mut res: u64 = 0;
        let bits_needed = n as i32 - self.bits_left as i32;
        if bits_needed > 0 {
            let bytes_needed = ((bits_needed - 1) / 8 + 1) as usize;
            let mut buf = [0u8; 8];
            self.read_not_aligned(&mut buf[..bytes_needed])?;
            for (i, b) in buf[..bytes_needed].iter().enumerate() {
                res |= (*b as u64) << (i * 8);
            }
            let new_bits = if bits_needed < 64 {
                res >> bits_needed
            } else {
                0
            };
            res = (res << self.bits_left) | self.bits;
            self.bits = new_bits;
        } else {
            res = self.bits;
            self.bits = if n < 64 { self.bits >> n } else { 0 };
        }
        self.bits_left = ((-bits_needed) & 7) as u32;
        if n < 64 {
            res &= (1u64 << n) - 1;
        }
        Ok(res)
    }

    pub fn read_bytes(&mut self, len: u64) -> Result<Vec<u8>, StreamError> {
        self.align_to_byte();
        self.ensure(len)?;
        let mut buf = vec![0u8; len as usize];
        self.read_not_aligned(&mut buf)?;
        Ok(buf)
    }

    /// Everything from the cursor to the end of the (sub)stream.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, StreamError> {
        self.align_to_byte();
        let rest = self.len - self.pos;
        self.read_bytes(rest)
    }

    /// Read until `terminator` is found.
    ///
    /// Single-byte terminators are scanned byte by byte, longer ones in terminator-sized
    /// units. When the end is hit first, `eos_error` decides between failing and returning
    /// what was consumed.
    pub fn read_until(
        &mut self,
        terminator: &[u8],
        include: bool,
        consume: bool,
        eos_error: bool,
    ) -> Result<Vec<u8>, StreamError> {
        self.align_to_byte();
        if terminator.is_empty() {
            return Err(StreamError::UnsupportedWidth(0));
        }
        let mut out = Vec::new();
        if let [term] = terminator {
            loop {
                if self.pos >= self.len {
                    if eos_error {
                        return Err(StreamError::MissingTerminator {
                            terminator: hex_bytes(terminator),
                        });
                    }
                    return Ok(out);
                }
                let c = self.data.byte_at(self.base + self.pos);
                self.pos += 1;
                if c == *term {
                    if include {
                        out.push(c);
                    }
                    if !consume {
                        self.pos -= 1;
                    }
                    return Ok(out);
                }
                out.push(c);
            }
        }
        let unit = terminator.len() as u64;
        let mut chunk = vec![0u8; terminator.len()];
        loop {
            let rest = self.len - self.pos;
            if rest < unit {
                if eos_error {
                    return Err(StreamError::MissingTerminator {
                        terminator: hex_bytes(terminator),
                    });
                }
                let tail = self.read_bytes(rest)?;
                out.extend_from_slice(&tail);
                return Ok(out);
            }
            self.read_not_aligned(&mut chunk)?;
            if chunk == terminator {
                if include {
                    out.extend_from_slice(&chunk);
                }
                if !consume {
                    self.pos -= unit;
                }
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Consume `len` bytes and return a bounded substream over them.
    pub fn substream(&mut self, len: u64) -> Result<ByteSource<'a>, StreamError> {
        self.align_to_byte();
        self.ensure(len)?;
        let sub = ByteSource {
            data: self.data,
            base: self.base + self.pos,
            len,
            pos: 0,
            bits: 0,
            bits_left: 0,
        };
        self.pos += len;
        Ok(sub)
    }

    /// Substream over `[start, start + len)` of this stream, without moving the cursor.
    pub fn slice(&self, start: u64, len: u64) -> Result<ByteSource<'a>, StreamError> {
        if start > self.len || len > self.len - start {
            return Err(StreamError::EndOfStream {
                pos: self.base + start,
                needed: len,
                available: self.len.saturating_sub(start),
            });
        }
        Ok(ByteSource {
            data: self.data,
            base: self.base + start,
            len,
            pos: 0,
            bits: 0,
            bits_left: 0,
        })
    }

    pub fn write_bytes(&mut self, _bytes: &[u8]) -> Result<(), StreamError> {
        Err(StreamError::UnsupportedOperation("write_bytes"))
    }

    pub fn write_unsigned(
        &mut self,
        _width: usize,
        _endian: Endianness,
        _value: u64,
    ) -> Result<(), StreamError> {
        Err(StreamError::UnsupportedOperation("write_unsigned"))
    }
}

/// `[0a 1b]` style rendering used in diagnostics.
pub fn hex_bytes(b: &[u8]) -> String {
    let inner = b
        .iter()
        .map(|x| format!("{:02x}", x))
        .collect::<Vec<_>>()
        .join(" ");
    format!("[{}]", inner)
}
