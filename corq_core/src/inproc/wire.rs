//! Message codec for the in-proc transport.
//!
//! Every request and response crosses a call as a bincode payload, the same
//! serialize-at-the-boundary discipline the runtime's consumers get from a
//! real RPC library's wire encoding. A decode failure never raises; the
//! operation that needed the payload reports a false framing bit instead.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to encode message: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(bincode::Error),
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    bincode::serialize(value).map_err(WireError::Encode)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    bincode::deserialize(bytes).map_err(WireError::Decode)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde::Deserialize;

    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Probe {
        name: String,
        count: u32,
    }

    #[test]
    fn encoded_messages_decode_to_the_same_value() {
        let probe = Probe {
            name: "hola".to_string(),
            count: 3,
        };
        let bytes = encode(&probe).unwrap();
        let back: Probe = decode(&bytes).unwrap();
        assert_eq!(back, probe);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result: Result<Probe, _> = decode(&[0xff, 0xff]);
        assert_matches!(result, Err(WireError::Decode(_)));
    }
}
