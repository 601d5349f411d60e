//! The binary encoding of a `ParameterSet`.
//!
//! Every integer is little-endian. A set is a `u32` entry count followed by its entries:
//!
//! ```text
//! name: u32 len + utf8 | dtype: u8 | ndim: u32 | dims: ndim * u32 |
//! device: u32 len + utf8 | byte_length: u32 | payload: byte_length bytes
//! ```

use crate::{AggregationError, Dtype, ParameterSet, Tensor, tensor};

/// Converts parameter sets to and from their wire representation.
pub struct ParameterCodec;

impl ParameterCodec {
    /// Encodes `params` into a new buffer.
    pub fn encode(params: &ParameterSet) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(params));
        Self::encode_into(params, &mut buf);
        buf
    }

    /// Appends the encoding of `params` to `buf`.
    pub fn encode_into(params: &ParameterSet, buf: &mut Vec<u8>) {
        put_u32(buf, params.len() as u32);

        for (name, tensor) in params.iter() {
            put_str(buf, name);
            buf.push(tensor.dtype().tag());

            put_u32(buf, tensor.shape().len() as u32);
            for &dim in tensor.shape() {
                put_u32(buf, dim);
            }

            put_str(buf, tensor.device());

            // `Tensor` guarantees its byte length fits the field.
            put_u32(buf, tensor.bytes().len() as u32);
            buf.extend_from_slice(tensor.bytes());
        }
    }

    /// Decodes a buffer holding exactly one encoded parameter set.
    ///
    /// # Returns
    /// The parameter set, `UnsupportedDtype` on an unknown element tag or `CorruptPayload`
    /// if any declared length disagrees with the data.
    pub fn decode(buf: &[u8]) -> Result<ParameterSet, AggregationError> {
        let mut reader = Reader::new(buf);
        let params = Self::decode_from(&mut reader)?;
        reader.finish()?;
        Ok(params)
    }

    /// Decodes a parameter set starting at the reader's position.
    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<ParameterSet, AggregationError> {
        let entries = reader.u32("entry count")?;
        let mut params = ParameterSet::new();

        for _ in 0..entries {
            let name = reader.string("name")?;
            let dtype = Dtype::from_tag(reader.u8("dtype")?)?;

            let ndim = reader.u32("ndim")?;
            let shape = (0..ndim)
                .map(|_| reader.u32("shape"))
                .collect::<Result<Vec<_>, _>>()?;

            let device = reader.string("device")?;
            let declared = reader.u32("byte length")? as usize;

            let expected = tensor::numel(&shape)
                .and_then(|n| n.checked_mul(dtype.size()))
                .ok_or_else(|| {
                    AggregationError::corrupt(format!("entry '{name}' has an overflowing shape"))
                })?;

            if declared != expected {
                return Err(AggregationError::corrupt(format!(
                    "entry '{name}' declares {declared} bytes but a {dtype} tensor of shape {shape:?} holds {expected}"
                )));
            }

            let data = reader.take(declared, "payload")?.to_vec();
            let tensor = Tensor::from_raw(dtype, shape, device, data)?;

            if params.insert(name.clone(), tensor).is_some() {
                return Err(AggregationError::corrupt(format!(
                    "entry '{name}' appears twice"
                )));
            }
        }

        Ok(params)
    }

    /// The exact amount of bytes `encode` produces for `params`.
    pub fn encoded_len(params: &ParameterSet) -> usize {
        let entries: usize = params
            .iter()
            .map(|(name, t)| {
                4 + name.len() + 1 + 4 + 4 * t.shape().len() + 4 + t.device().len() + 4 + t.bytes().len()
            })
            .sum();

        4 + entries
    }
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    put_u32(buf, value.len() as u32);
    buf.extend_from_slice(value.as_bytes());
}

/// A bounds checked cursor over an encoded buffer.
///
/// Running out of bytes is reported as `CorruptPayload`, naming the field being read.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], AggregationError> {
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(AggregationError::corrupt(format!(
                "truncated {field}: needs {len} bytes, {remaining} left"
            )));
        }

        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], AggregationError> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self, field: &str) -> Result<u8, AggregationError> {
        Ok(self.array::<1>(field)?[0])
    }

    pub(crate) fn u32(&mut self, field: &str) -> Result<u32, AggregationError> {
        self.array(field).map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self, field: &str) -> Result<u64, AggregationError> {
        self.array(field).map(u64::from_le_bytes)
    }

    pub(crate) fn string(&mut self, field: &str) -> Result<String, AggregationError> {
        let len = self.u32(field)? as usize;
        let bytes = self.take(len, field)?;

        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| AggregationError::corrupt(format!("invalid utf-8 in {field}: {e}")))
    }

    /// Fails if there are bytes left after the last field.
    pub(crate) fn finish(self) -> Result<(), AggregationError> {
        let trailing = self.buf.len() - self.pos;
        if trailing > 0 {
            return Err(AggregationError::corrupt(format!(
                "{trailing} trailing bytes after the last entry"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParameterSet {
        [
            ("w", Tensor::from_slice(&[2, 3], &[1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap()),
            ("b", Tensor::vector(&[7i64, -8]).with_device("cuda:1")),
        ]
        .into_iter()
        .collect()
    }

    /// Offset of the `byte_length` field of the first entry of `sample()`.
    fn first_byte_length_offset() -> usize {
        // count + name("w") + dtype + ndim + 2 dims + device("cpu")
        4 + (4 + 1) + 1 + 4 + 8 + (4 + 3)
    }

    #[test]
    fn decode_inverts_encode() {
        let params = sample();
        let buf = ParameterCodec::encode(&params);
        assert_eq!(buf.len(), ParameterCodec::encoded_len(&params));

        let decoded = ParameterCodec::decode(&buf).unwrap();
        assert_eq!(decoded, params);
        assert_eq!(decoded.get("b").unwrap().device(), "cuda:1");
        assert_eq!(decoded.names().collect::<Vec<_>>(), ["w", "b"]);
    }

    #[test]
    fn tampered_byte_length_is_corrupt() {
        let mut buf = ParameterCodec::encode(&sample());
        let offset = first_byte_length_offset();
        assert_eq!(u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()), 24);

        buf[offset..offset + 4].copy_from_slice(&20u32.to_le_bytes());
        let err = ParameterCodec::decode(&buf).unwrap_err();
        assert!(matches!(err, AggregationError::CorruptPayload { .. }), "{err:?}");
    }

    #[test]
    fn unknown_dtype_lists_supported_set() {
        let mut buf = ParameterCodec::encode(&sample());
        // count + name("w")
        buf[4 + 5] = 42;

        match ParameterCodec::decode(&buf).unwrap_err() {
            AggregationError::UnsupportedDtype { dtype, supported } => {
                assert_eq!(dtype, "tag 42");
                assert_eq!(supported, ["float32", "float64", "int32", "int64", "bool"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn truncated_and_trailing_buffers_are_corrupt() {
        let buf = ParameterCodec::encode(&sample());

        let err = ParameterCodec::decode(&buf[..buf.len() - 1]).unwrap_err();
        assert!(matches!(err, AggregationError::CorruptPayload { .. }));

        let mut longer = buf.clone();
        longer.push(0);
        let err = ParameterCodec::decode(&longer).unwrap_err();
        assert!(matches!(err, AggregationError::CorruptPayload { .. }));
    }

    #[test]
    fn empty_dimension_is_corrupt() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 1);
        put_str(&mut buf, "w");
        buf.push(Dtype::F32.tag());
        put_u32(&mut buf, 2);
        put_u32(&mut buf, 3);
        put_u32(&mut buf, 0);
        put_str(&mut buf, "cpu");
        put_u32(&mut buf, 0);

        let err = ParameterCodec::decode(&buf).unwrap_err();
        assert!(matches!(err, AggregationError::CorruptPayload { .. }), "{err:?}");
        assert!(Tensor::from_slice::<f32>(&[3, 0], &[]).is_err());
    }

    #[test]
    fn empty_set_round_trips() {
        let buf = ParameterCodec::encode(&ParameterSet::new());
        assert_eq!(buf, 0u32.to_le_bytes());
        assert!(ParameterCodec::decode(&buf).unwrap().is_empty());
    }
}
