use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN, Serialize};

/// Writes `msg` into `buf` as a complete frame, its length prefix included.
///
/// # Returns
/// An `InvalidInput` error if the body is larger than `MAX_FRAME_LEN`, the peer would
/// reject it anyway.
fn frame<T: Serialize>(buf: &mut Vec<u8>, msg: &T) -> io::Result<()> {
    buf.clear();
    buf.resize(LEN_TYPE_SIZE, 0);
    msg.serialize(buf)?;

    let len = (buf.len() - LEN_TYPE_SIZE) as LenType;
    if len > MAX_FRAME_LEN {
        let text = format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}");
        return Err(io::Error::new(io::ErrorKind::InvalidInput, text));
    }

    buf[..LEN_TYPE_SIZE].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

/// The sending end of a framed connection.
///
/// The frame buffer is reused between messages.
pub struct FrameSender<W: AsyncWrite + Unpin> {
    tx: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameSender<W> {
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            buf: Vec::new(),
        }
    }

    /// Sends `msg` as a single length prefixed frame and flushes the writer.
    ///
    /// Nothing is written if `msg` fails to serialize.
    pub async fn send<T: Serialize>(&mut self, msg: &T) -> io::Result<()> {
        frame(&mut self.buf, msg)?;
        self.tx.write_all(&self.buf).await?;
        self.tx.flush().await
    }
}
