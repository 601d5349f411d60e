use std::io;

/// Writes a message body into an output buffer.
pub trait Serialize {
    fn serialize(&self, buf: &mut Vec<u8>) -> io::Result<()>;
}
