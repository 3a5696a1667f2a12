// JSON documents on top of plain files.
//
// A file holds exactly one serialized value. Encoding and decoding go
// through a buffer the caller owns, so a document is limited to that
// buffer's size.

use core::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum JsonError {
    /// The value did not fit the caller's buffer.
    Encode(serde_json_core::ser::Error),
    /// The file is not valid JSON for the requested type.
    Decode(serde_json_core::de::Error),
    /// The file is larger than the caller's buffer.
    TooLarge { size: u32, cap: usize },
}

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonError::Encode(e) => write!(f, "encode: {}", e),
            JsonError::Decode(e) => write!(f, "decode: {}", e),
            JsonError::TooLarge { size, cap } => {
                write!(f, "document of {} bytes exceeds {} byte buffer", size, cap)
            }
        }
    }
}

pub(crate) fn encode<V: Serialize + ?Sized>(value: &V, buf: &mut [u8]) -> Result<usize, JsonError> {
    serde_json_core::to_slice(value, buf).map_err(JsonError::Encode)
}

pub(crate) fn decode<'b, V: Deserialize<'b>>(data: &'b [u8]) -> Result<V, JsonError> {
    let (value, _) = serde_json_core::from_slice(data).map_err(JsonError::Decode)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading<'a> {
        sensor: &'a str,
        value: i32,
    }

    #[test]
    fn values_borrow_from_the_buffer() {
        let mut buf = [0u8; 64];
        let n = encode(&Reading { sensor: "t1", value: -4 }, &mut buf).unwrap();
        assert_eq!(&buf[..n], br#"{"sensor":"t1","value":-4}"#);

        let back: Reading = decode(&buf[..n]).unwrap();
        assert_eq!(back, Reading { sensor: "t1", value: -4 });
    }

    #[test]
    fn small_buffers_and_bad_input_are_errors() {
        let mut buf = [0u8; 8];
        let err = encode(&Reading { sensor: "t1", value: 1 }, &mut buf).unwrap_err();
        assert!(matches!(err, JsonError::Encode(_)));

        let err = decode::<Reading>(br#"{"sensor":"t1""#).unwrap_err();
        assert!(matches!(err, JsonError::Decode(_)));
    }
}
