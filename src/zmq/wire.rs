//! Binary message layout for the ZMQ frontend (`spec.md` §4.5).
//!
//! All multi-byte integers are little-endian. The identity frame and empty delimiter frame
//! required by ROUTER sockets are handled by the caller; this module only encodes/decodes the
//! payload frame.

use thiserror::Error;

use crate::query::{InputTensor, InputType, QueryLineage};

/// Error decoding a wire message.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WireError {
    /// The payload ended before a required field could be read.
    #[error("truncated message: wanted {wanted} more bytes, had {had}")]
    Truncated {
        /// Bytes required to complete the field being read.
        wanted: usize,
        /// Bytes actually remaining.
        had: usize,
    },
    /// An `app_name` or UTF-8 string input field was not valid UTF-8.
    #[error("field is not valid utf-8: {0}")]
    InvalidUtf8(std::str::Utf8Error),
    /// The `input_type_code`/`output_type_code` byte did not name a known input type.
    #[error("unrecognized input type code {0}")]
    UnknownTypeCode(u8),
    /// The element count did not evenly divide the remaining payload for a fixed-width type.
    #[error("input_length {input_length} does not match payload of {payload_len} bytes")]
    LengthMismatch {
        /// Declared element count.
        input_length: usize,
        /// Actual number of payload bytes available for the element data.
        payload_len: usize,
    },
}

/// A decoded client request frame.
#[derive(Clone, Debug, PartialEq)]
pub struct WireRequest {
    /// Client id assigned at handshake (truncated to 32 bits on the wire).
    pub client_id: u32,
    /// Opaque request id, echoed back in the response.
    pub request_id: u32,
    /// Target application name.
    pub app_name: String,
    /// Decoded input tensor.
    pub input: InputTensor,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(WireError::Truncated {
                wanted: n,
                had: remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("length checked above");
        Ok(u32::from_le_bytes(bytes))
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

/// Decode a client request frame per `spec.md` §4.5's request message layout.
///
/// # Errors
///
/// Returns `Err` if the payload is truncated, names an unknown input type, or its declared
/// element count does not match the remaining payload length.
pub fn decode_request(payload: &[u8]) -> Result<WireRequest, WireError> {
    let mut cursor = Cursor::new(payload);
    let client_id = cursor.u32()?;
    let request_id = cursor.u32()?;
    let app_name_length = cursor.u32()? as usize;
    let app_name_bytes = cursor.take(app_name_length)?;
    let app_name = std::str::from_utf8(app_name_bytes)
        .map_err(WireError::InvalidUtf8)?
        .to_string();
    let input_type_code = cursor.u8()?;
    let input_type =
        InputType::from_wire_code(input_type_code).ok_or(WireError::UnknownTypeCode(input_type_code))?;
    let input_length = cursor.u32()? as usize;
    let element_bytes = cursor.rest();
    let input = decode_tensor(input_type, input_length, element_bytes)?;
    Ok(WireRequest {
        client_id,
        request_id,
        app_name,
        input,
    })
}

fn decode_tensor(
    input_type: InputType,
    input_length: usize,
    bytes: &[u8],
) -> Result<InputTensor, WireError> {
    let expect_len = |width: usize| {
        if bytes.len() != input_length * width {
            Err(WireError::LengthMismatch {
                input_length,
                payload_len: bytes.len(),
            })
        } else {
            Ok(())
        }
    };
    match input_type {
        InputType::F64 => {
            expect_len(8)?;
            let values = bytes
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().expect("chunk size 8")))
                .collect();
            Ok(InputTensor::F64(values))
        }
        InputType::F32 => {
            expect_len(4)?;
            let values = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes(c.try_into().expect("chunk size 4")))
                .collect();
            Ok(InputTensor::F32(values))
        }
        InputType::I32 => {
            expect_len(4)?;
            let values = bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes(c.try_into().expect("chunk size 4")))
                .collect();
            Ok(InputTensor::I32(values))
        }
        InputType::Byte => {
            expect_len(1)?;
            Ok(InputTensor::Byte(bytes.to_vec()))
        }
        InputType::Utf8String => {
            if bytes.len() != input_length {
                return Err(WireError::LengthMismatch {
                    input_length,
                    payload_len: bytes.len(),
                });
            }
            let s = std::str::from_utf8(bytes)
                .map_err(WireError::InvalidUtf8)?
                .to_string();
            Ok(InputTensor::Utf8String(s))
        }
    }
}

/// Encode the 4-byte handshake acknowledgment containing the assigned `client_id`.
#[must_use]
pub fn encode_handshake_ack(client_id: u32) -> Vec<u8> {
    client_id.to_le_bytes().to_vec()
}

/// Encode a response frame per `spec.md` §4.5's response message layout.
#[must_use]
pub fn encode_response(request_id: u32, output: f64, lineage: &QueryLineage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&request_id.to_le_bytes());
    buf.push(InputType::F64.wire_code());
    let output_bytes = output.to_le_bytes();
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&output_bytes);
    let lineage_json = serde_json::to_vec(lineage).unwrap_or_default();
    buf.extend_from_slice(&(lineage_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&lineage_json);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&42u32.to_le_bytes());
        let name = b"alpha";
        buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
        buf.extend_from_slice(name);
        buf.push(InputType::F64.wire_code());
        buf.extend_from_slice(&3u32.to_le_bytes());
        for v in [1.0f64, 2.0, 3.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf
    }

    #[test]
    fn decode_request_round_trips_f64_tensor() {
        let req = decode_request(&sample_request_bytes()).unwrap();
        assert_eq!(req.client_id, 7);
        assert_eq!(req.request_id, 42);
        assert_eq!(req.app_name, "alpha");
        assert_eq!(req.input, InputTensor::F64(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn decode_request_rejects_truncated_payload() {
        let bytes = sample_request_bytes();
        let err = decode_request(&bytes[..6]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn decode_request_rejects_length_mismatch() {
        let mut bytes = sample_request_bytes();
        let last = bytes.len();
        bytes.truncate(last - 4);
        let err = decode_request(&bytes).unwrap_err();
        assert!(matches!(err, WireError::LengthMismatch { .. }));
    }

    #[test]
    fn encode_response_is_decodable_by_hand() {
        let mut lineage = QueryLineage::default();
        lineage.mark("qp::response_received");
        let bytes = encode_response(42, 3.5, &lineage);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 42);
        assert_eq!(bytes[4], InputType::F64.wire_code());
        assert_eq!(u32::from_le_bytes(bytes[5..9].try_into().unwrap()), 1);
        let output = f64::from_le_bytes(bytes[9..17].try_into().unwrap());
        assert!((output - 3.5).abs() < f64::EPSILON);
    }

    #[test]
    fn handshake_ack_is_four_bytes() {
        assert_eq!(encode_handshake_ack(9).len(), 4);
    }
}
