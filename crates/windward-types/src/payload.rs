use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;

/// Codec used to encode/decode payload bytes.
/// Matches the SDK's supported serialization formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Json,
    Binary,
}

/// Opaque bytes with an associated codec.
///
/// The data converter at the SDK boundary owns conversion to and from user
/// types. The replay core never interprets payload bytes; it only stores,
/// compares, and re-surfaces them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub bytes: Vec<u8>,
    pub codec: Codec,
}

impl Payload {
    /// Create a payload from raw bytes and their codec.
    pub fn new(bytes: Vec<u8>, codec: Codec) -> Self {
        Self { bytes, codec }
    }

    /// Encode a serializable value with the default JSON codec.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
            codec: Codec::Json,
        })
    }

    /// Decode a JSON payload into a concrete type.
    ///
    /// Fails on a non-JSON codec; callers that accept arbitrary codecs must
    /// go through the data converter instead.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }
}

impl fmt::Debug for Payload {
    /// Renders at most the first eight bytes as hex; history payloads can be
    /// arbitrarily large and routinely end up in log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = &self.bytes[..self.bytes.len().min(8)];
        write!(
            f,
            "Payload({:?}, {}b, {}{})",
            self.codec,
            self.bytes.len(),
            hex::encode(shown),
            if self.bytes.len() > 8 { ".." } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let p = Payload::json(&42u32).unwrap();
        assert_eq!(p.codec, Codec::Json);
        assert_eq!(p.decode_json::<u32>().unwrap(), 42);
    }

    #[test]
    fn debug_truncates_long_payloads() {
        let p = Payload::new(vec![0xab; 32], Codec::Binary);
        let rendered = format!("{p:?}");
        assert!(rendered.contains("32b"));
        assert!(rendered.ends_with("..)"));
    }
}
