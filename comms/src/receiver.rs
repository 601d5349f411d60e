use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{CommError, Deserialize, LEN_TYPE_SIZE, LenType, MAX_FRAME_LEN};

/// The buffer capacity kept between frames, larger buffers are released after use.
const RETAINED_CAPACITY: usize = 1 << 20;

/// The receiving end handle of the communication.
pub struct FrameReceiver<R: AsyncRead + Unpin> {
    rx: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReceiver<R> {
    /// Creates a new `FrameReceiver` instance.
    ///
    /// # Arguments
    /// * `rx` - The underlying reader.
    pub(super) fn new(rx: R) -> Self {
        Self {
            rx,
            buf: Vec::new(),
        }
    }

    /// Waits to receive a new message from the inner reader.
    ///
    /// A frame that fails to deserialize is consumed entirely, so the stream stays usable
    /// after a `CommError::Aggregation`. The body is buffered as it arrives, a length
    /// prefix alone never reserves memory.
    ///
    /// # Returns
    /// The message, `CommError::Io` if the stream failed or `CommError::Aggregation` if
    /// the frame's body is malformed.
    pub async fn recv<T: Deserialize>(&mut self) -> Result<T, CommError> {
        let mut size_buf = [0; LEN_TYPE_SIZE];
        self.rx.read_exact(&mut size_buf).await?;
        let len = LenType::from_be_bytes(size_buf);

        if len > MAX_FRAME_LEN {
            let text = format!("frame of {len} bytes exceeds the limit of {MAX_FRAME_LEN}");
            return Err(io::Error::new(io::ErrorKind::InvalidData, text).into());
        }

        self.buf.clear();
        let read = (&mut self.rx).take(len).read_to_end(&mut self.buf).await?;

        if (read as LenType) < len {
            let text = format!("stream closed after {read} of the {len} bytes of a frame");
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, text).into());
        }

        let msg = T::deserialize(&self.buf);
        if self.buf.capacity() > RETAINED_CAPACITY {
            self.buf = Vec::new();
        }

        Ok(msg?)
    }
}
