//! Byte sinks for the two-pass codec, and the matching bounds-checked reader.
//!
//! Every encoder in this crate is written once, generic over [`Sink`]. The
//! [`CountingSink`] pass walks the value and only adds up lengths; the
//! [`BufferSink`] pass walks it again into a buffer allocated to exactly that
//! size. Because both passes run the same function, they cannot disagree
//! about traversal order.
//!
//! All integers are little-endian.

use crate::CodecError;

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Destination for encoded bytes.
pub trait Sink {
    /// Append raw bytes.
    fn put(&mut self, bytes: &[u8]);

    fn put_u8(&mut self, value: u8) {
        self.put(&[value]);
    }

    fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    fn put_u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }

    fn put_i16(&mut self, value: i16) {
        self.put(&value.to_le_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.put(&value.to_le_bytes());
    }

    fn put_i64(&mut self, value: i64) {
        self.put(&value.to_le_bytes());
    }

    /// A collection length. Collections in this format never exceed
    /// `u32::MAX` elements.
    fn put_len(&mut self, len: usize) {
        self.put_u32(len as u32);
    }

    /// A `u32`-length-prefixed UTF-8 string.
    fn put_str(&mut self, value: &str) {
        self.put_len(value.len());
        self.put(value.as_bytes());
    }
}

/// Counts bytes without storing them.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountingSink {
    count: u64,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes seen so far.
    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Sink for CountingSink {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.count += bytes.len() as u64;
    }
}

/// Writes into a buffer sized up front. The buffer never grows past the
/// size it was created with.
#[derive(Debug)]
pub struct BufferSink {
    buf: Vec<u8>,
    limit: usize,
}

impl BufferSink {
    /// A sink that will hold exactly `len` bytes.
    pub fn exact(len: u64) -> Self {
        let limit = len as usize;
        Self {
            buf: Vec::with_capacity(limit),
            limit,
        }
    }

    pub fn written(&self) -> usize {
        self.buf.len()
    }

    /// The filled buffer.
    ///
    /// # Panics
    ///
    /// Panics if fewer bytes were written than the sink was sized for,
    /// which means the counting and writing passes diverged.
    pub fn into_bytes(self) -> Vec<u8> {
        assert_eq!(
            self.buf.len(),
            self.limit,
            "writing pass produced {} bytes but counting pass measured {}",
            self.buf.len(),
            self.limit
        );
        self.buf
    }
}

impl Sink for BufferSink {
    fn put(&mut self, bytes: &[u8]) {
        assert!(
            self.buf.len() + bytes.len() <= self.limit,
            "writing pass overran the measured size of {} bytes",
            self.limit
        );
        self.buf.extend_from_slice(bytes);
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Bounds-checked cursor over encoded bytes. Every error carries the offset
/// it was detected at.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    /// Take the next `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                offset: self.offset(),
                needed: len as u64,
                available: self.remaining() as u64,
            });
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        let offset = self.offset();
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::BadTag {
                offset,
                what: "bool",
                tag: u64::from(other),
            }),
        }
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, CodecError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    /// A collection length. Rejects lengths that could not possibly fit in
    /// the remaining input, given at least `min_element` bytes per element.
    pub fn seq_len(&mut self, min_element: usize) -> Result<usize, CodecError> {
        let offset = self.offset();
        let len = self.u32()? as usize;
        if len.saturating_mul(min_element.max(1)) > self.remaining() {
            return Err(CodecError::Truncated {
                offset,
                needed: (len.saturating_mul(min_element.max(1))) as u64,
                available: self.remaining() as u64,
            });
        }
        Ok(len)
    }

    pub fn str(&mut self) -> Result<String, CodecError> {
        let len = self.seq_len(1)?;
        let offset = self.offset();
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8 { offset })
    }

    /// Succeeds only if every byte has been consumed.
    pub fn finish(&self) -> Result<(), CodecError> {
        if self.remaining() != 0 {
            return Err(CodecError::TrailingBytes {
                offset: self.offset(),
                remaining: self.remaining() as u64,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
