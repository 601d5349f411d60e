pub mod codec;
pub mod config;
mod deserialize;
pub mod error;
pub mod msg;
mod receiver;
mod sender;
mod serialize;
pub mod specs;
pub mod tensor;

use tokio::io::{AsyncRead, AsyncWrite};

pub use codec::ParameterCodec;
pub use config::ConfigError;
pub use deserialize::Deserialize;
pub use error::{AggregationError, CommError};
pub use receiver::FrameReceiver;
pub use sender::FrameSender;
pub use serialize::Serialize;
pub use tensor::{Dtype, Element, ParameterSet, Tensor};

type LenType = u64;
const LEN_TYPE_SIZE: usize = size_of::<LenType>();

/// Frames larger than this are treated as a desynchronized stream.
pub const MAX_FRAME_LEN: LenType = 1 << 32;

/// Creates both `FrameReceiver` and `FrameSender` network channel parts.
///
/// Given a reader and a writer creates and returns both ends of the communication.
///
/// # Arguments
/// * `rx` - An async readable.
/// * `tx` - An async writable.
///
/// # Returns
/// A communication stream in the form of a frame receiver and sender.
pub fn channel<R, W>(rx: R, tx: W) -> (FrameReceiver<R>, FrameSender<W>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    (FrameReceiver::new(rx), FrameSender::new(tx))
}
