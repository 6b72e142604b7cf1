//! # pollnet-buf
//!
//! Growable, compacting FIFO byte queue used as the receive and send queue of
//! stream sockets, and as a general binary encoder/decoder.
//!
//! ## Storage policy
//!
//! - Storage grows in whole blocks ([`DEFAULT_BLOCK_SIZE`] unless configured).
//! - Before growing, unread bytes are shifted to offset 0 so a slow consumer
//!   does not cause unbounded growth.
//! - Once [`ByteBuffer::discard`] drains everything, storage shrinks back to a
//!   single block.
//! - The byte at the write cursor is always NUL, so the unread region can be
//!   viewed as a C string.
//!
//! Multi-byte integers and length prefixes use network byte order.

use std::ffi::CStr;
use std::fmt;
use std::io;
use std::ops::{Bound, RangeBounds};

/// Default growth block (4 KiB)
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Size of the length prefix written by [`ByteBuffer::write_blob`]
pub const LEN_PREFIX: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("out of memory: cannot grow buffer to {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("blob of {len} bytes does not fit a 32-bit length prefix")]
    TooLarge { len: usize },
}

/// FIFO byte queue with cursor-based read/peek/write.
///
/// `read <= write <= capacity` always holds; the unread length is
/// `write - read`.
pub struct ByteBuffer {
    data: Vec<u8>,
    read: usize,
    write: usize,
    block_size: usize,
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("read", &self.read)
            .field("write", &self.write)
            .field("capacity", &self.data.len())
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl ByteBuffer {
    /// Create an empty buffer. No storage is allocated until the first write.
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// Create an empty buffer growing in blocks of `block_size` bytes.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            read: 0,
            write: 0,
            block_size: block_size.max(1),
        }
    }

    /// Unread bytes
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Allocated storage in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn read_pos(&self) -> usize {
        self.read
    }

    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// Make room for `additional` more bytes after the write cursor.
    ///
    /// Compacts first, and only grows the storage when compaction is not
    /// enough. One byte past the data is always kept for the NUL terminator.
    pub fn reserve(&mut self, additional: usize) -> Result<(), BufferError> {
        let needed = self
            .write
            .checked_add(additional)
            .ok_or(BufferError::OutOfMemory {
                requested: usize::MAX,
            })?;
        if needed < self.data.len() {
            return Ok(());
        }

        self.compact();

        let needed = self.write + additional;
        if needed < self.data.len() {
            return Ok(());
        }
        self.grow(needed)
    }

    fn compact(&mut self) {
        if self.read > 0 {
            self.data.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }

    fn grow(&mut self, needed: usize) -> Result<(), BufferError> {
        // Block-aligned and strictly larger than `needed` (room for the NUL)
        let capacity = needed
            .checked_add(self.block_size)
            .map(|n| n / self.block_size * self.block_size)
            .ok_or(BufferError::OutOfMemory { requested: needed })?;

        self.data
            .try_reserve_exact(capacity - self.data.len())
            .map_err(|_| BufferError::OutOfMemory {
                requested: capacity,
            })?;
        self.data.resize(capacity, 0);
        Ok(())
    }

    /// Append `bytes`, returning how many were written.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, BufferError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        self.reserve(bytes.len())?;
        self.data[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        self.data[self.write] = 0;
        Ok(bytes.len())
    }

    /// Copy up to `out.len()` bytes out and consume them.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.read += n;
        n
    }

    /// Copy up to `out.len()` bytes out without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.data[self.read..self.read + n]);
        n
    }

    /// Consume up to `n` bytes. When the buffer becomes empty the cursors
    /// rewind and storage shrinks back to one block.
    pub fn discard(&mut self, n: usize) -> &mut Self {
        self.read += n.min(self.len());

        if self.read >= self.write {
            self.read = 0;
            self.write = 0;
            if !self.data.is_empty() {
                self.data[0] = 0;
                if self.data.len() > self.block_size {
                    self.data.truncate(self.block_size);
                    self.data.shrink_to_fit();
                }
            }
        }
        self
    }

    /// Consume up to `n` bytes, keeping cursors and storage as they are.
    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.read += n.min(self.len());
        self
    }

    /// Release storage and zero both cursors.
    pub fn reset(&mut self) {
        self.data = Vec::new();
        self.read = 0;
        self.write = 0;
    }

    /// Unread bytes, without copying
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// View of the unread region addressed relative to the read cursor.
    ///
    /// Returns `None` when the range falls outside the unread bytes.
    pub fn slice<R: RangeBounds<usize>>(&self, range: R) -> Option<&[u8]> {
        let len = self.len();
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => s.checked_add(1)?,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&e) => e.checked_add(1)?,
            Bound::Excluded(&e) => e,
            Bound::Unbounded => len,
        };
        if start > end || end > len {
            return None;
        }
        Some(&self.data[self.read + start..self.read + end])
    }

    /// Unread region up to the first NUL (the terminator at the write cursor
    /// at the latest).
    pub fn as_c_str(&self) -> Option<&CStr> {
        if self.data.is_empty() {
            return None;
        }
        CStr::from_bytes_until_nul(&self.data[self.read..=self.write]).ok()
    }

    /// Upper-case hex rendering of the unread bytes
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.as_slice())
    }

    fn peek_array<const N: usize>(&self) -> Option<[u8; N]> {
        self.as_slice().get(..N)?.try_into().ok()
    }

    pub fn write_u8(&mut self, v: u8) -> Result<usize, BufferError> {
        self.write(&[v])
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        let v = self.peek_u8()?;
        self.read += 1;
        Some(v)
    }

    /// Append a 32-bit big-endian length followed by `bytes`.
    ///
    /// Space for both is reserved up front so a failed write never leaves a
    /// dangling prefix behind.
    pub fn write_blob(&mut self, bytes: &[u8]) -> Result<usize, BufferError> {
        let prefix =
            u32::try_from(bytes.len()).map_err(|_| BufferError::TooLarge { len: bytes.len() })?;
        self.reserve(LEN_PREFIX + bytes.len())?;
        self.write(&prefix.to_be_bytes())?;
        self.write(bytes)?;
        Ok(LEN_PREFIX + bytes.len())
    }

    /// Length-prefixed blob at the read cursor, or `None` when incomplete.
    pub fn peek_blob(&self) -> Option<&[u8]> {
        let n = self.peek_u32()? as usize;
        self.as_slice().get(LEN_PREFIX..LEN_PREFIX.checked_add(n)?)
    }

    /// Consume a length-prefixed blob. Nothing is consumed when incomplete.
    pub fn read_blob(&mut self) -> Option<&[u8]> {
        let n = self.peek_blob()?.len();
        let start = self.read + LEN_PREFIX;
        self.read = start + n;
        Some(&self.data[start..start + n])
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) -> Result<usize, BufferError> {
        self.write_blob(s.as_bytes())
    }

    /// Consume a length-prefixed UTF-8 string. Nothing is consumed when the
    /// blob is incomplete or not valid UTF-8.
    pub fn read_str(&mut self) -> Option<&str> {
        std::str::from_utf8(self.peek_blob()?).ok()?;
        let bytes = self.read_blob()?;
        std::str::from_utf8(bytes).ok()
    }

    /// Append `s` up to its first NUL, then a NUL terminator.
    pub fn write_cstr(&mut self, s: impl AsRef<[u8]>) -> Result<usize, BufferError> {
        let s = s.as_ref();
        let s = match s.iter().position(|&b| b == 0) {
            Some(nul) => &s[..nul],
            None => s,
        };
        self.reserve(s.len() + 1)?;
        self.write(s)?;
        self.write(&[0])?;
        Ok(s.len() + 1)
    }

    /// NUL-terminated string at the read cursor (terminator excluded), or
    /// `None` when no terminator has arrived yet.
    pub fn peek_cstr(&self) -> Option<&[u8]> {
        let unread = self.as_slice();
        let nul = unread.iter().position(|&b| b == 0)?;
        Some(&unread[..nul])
    }

    /// Consume a NUL-terminated string, terminator included.
    pub fn read_cstr(&mut self) -> Option<&[u8]> {
        let n = self.peek_cstr()?.len();
        let start = self.read;
        self.read += n + 1;
        Some(&self.data[start..start + n])
    }
}

macro_rules! be_codec {
    ($($ty:ty => $write:ident, $peek:ident, $read:ident;)*) => {
        impl ByteBuffer {
            $(
                #[doc = concat!("Append a big-endian `", stringify!($ty), "`.")]
                pub fn $write(&mut self, v: $ty) -> Result<usize, BufferError> {
                    self.write(&v.to_be_bytes())
                }

                #[doc = concat!("Big-endian `", stringify!($ty), "` at the read cursor, if enough bytes are buffered.")]
                pub fn $peek(&self) -> Option<$ty> {
                    self.peek_array().map(<$ty>::from_be_bytes)
                }

                #[doc = concat!("Consume a big-endian `", stringify!($ty), "`.")]
                pub fn $read(&mut self) -> Option<$ty> {
                    let v = self.$peek()?;
                    self.read += std::mem::size_of::<$ty>();
                    Some(v)
                }
            )*
        }
    };
}

be_codec! {
    u16 => write_u16, peek_u16, read_u16;
    u32 => write_u32, peek_u32, read_u32;
    u64 => write_u64, peek_u64, read_u64;
}

impl io::Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ByteBuffer::write(self, buf).map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for ByteBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(ByteBuffer::read(self, buf))
    }
}
