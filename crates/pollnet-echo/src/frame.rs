//! Ping frames: a length-prefixed body of sequence number and send time.

use anyhow::{bail, Result};
use pollnet_buf::ByteBuffer;

/// Body bytes: u32 sequence + u64 milliseconds, both big-endian.
pub const FRAME_BODY: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub sent_ms: u64,
}

impl Frame {
    pub fn encode(&self, out: &mut ByteBuffer) -> Result<()> {
        let mut body = ByteBuffer::with_block_size(FRAME_BODY + 1);
        body.write_u32(self.seq)?;
        body.write_u64(self.sent_ms)?;
        out.write_blob(body.as_slice())?;
        Ok(())
    }

    /// Next complete frame in `inbuf`, or `None` until one has arrived.
    pub fn decode(inbuf: &mut ByteBuffer) -> Result<Option<Frame>> {
        let Some(body) = inbuf.read_blob() else {
            return Ok(None);
        };
        if body.len() != FRAME_BODY {
            bail!("frame body is {} bytes, expected {}", body.len(), FRAME_BODY);
        }
        let seq = u32::from_be_bytes(body[..4].try_into()?);
        let sent_ms = u64::from_be_bytes(body[4..].try_into()?);
        Ok(Some(Frame { seq, sent_ms }))
    }
}
