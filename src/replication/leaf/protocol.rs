//! Leaf wire protocol
//!
//! A frame is a bincode payload followed by a single message type byte.
//! Gossip frames carry a `Vec<E>` batch; `FullSync` and `FullSyncEnd`
//! carry an empty payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LeafError {
    #[error("empty frame")]
    EmptyFrame,
    #[error("unknown leaf message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected {0:?} frame")]
    Unexpected(LeafMessageType),
    #[error("bincode: {0}")]
    Codec(#[from] bincode::Error),
    #[error("version mismatch: {0}")]
    VersionMismatch(String),
    #[error("connection closed")]
    Closed,
    #[error("link error: {0}")]
    Link(String),
}

impl LeafError {
    /// Errors after which the leaf must stop reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LeafError::VersionMismatch(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LeafMessageType {
    Register = 0,
    FullSync = 1,
    FullSyncEnd = 2,
    GossipGroup = 3,
    GossipRole = 4,
    GossipTemplate = 5,
    GossipTemplateVar = 6,
    GossipUser = 7,
    GossipScript = 8,
    GossipResponse = 9,
    GossipSession = 10,
}

impl TryFrom<u8> for LeafMessageType {
    type Error = LeafError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Register,
            1 => Self::FullSync,
            2 => Self::FullSyncEnd,
            3 => Self::GossipGroup,
            4 => Self::GossipRole,
            5 => Self::GossipTemplate,
            6 => Self::GossipTemplateVar,
            7 => Self::GossipUser,
            8 => Self::GossipScript,
            9 => Self::GossipResponse,
            10 => Self::GossipSession,
            other => return Err(LeafError::UnknownMessageType(other)),
        })
    }
}

/// First frame sent by a leaf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Register {
    pub leaf_version: String,
    pub zone: String,
}

/// The origin's answer to `Register`, sent with the same message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub error: String,
}

impl RegisterResponse {
    pub fn ok() -> Self {
        Self { success: true, error: String::new() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: error.into() }
    }
}

pub fn encode_frame<T: Serialize + ?Sized>(
    kind: LeafMessageType,
    payload: &T,
) -> Result<Vec<u8>, LeafError> {
    let mut frame = bincode::serialize(payload)?;
    frame.push(kind as u8);
    Ok(frame)
}

/// Frame with no payload, such as `FullSync` or `FullSyncEnd`.
pub fn control_frame(kind: LeafMessageType) -> Vec<u8> {
    vec![kind as u8]
}

pub fn decode_frame(frame: &[u8]) -> Result<(LeafMessageType, &[u8]), LeafError> {
    let (kind, payload) = frame.split_last().ok_or(LeafError::EmptyFrame)?;
    Ok((LeafMessageType::try_from(*kind)?, payload))
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, LeafError> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_byte_is_trailing() {
        let frame = encode_frame(LeafMessageType::GossipUser, &vec![1u8, 2, 3]).unwrap();
        assert_eq!(*frame.last().unwrap(), 7);

        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, LeafMessageType::GossipUser);
        assert_eq!(decode_payload::<Vec<u8>>(payload).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_wire_values() {
        assert_eq!(LeafMessageType::Register as u8, 0);
        assert_eq!(LeafMessageType::GossipUser as u8, 7);
        assert_eq!(LeafMessageType::GossipScript as u8, 8);
        assert_eq!(LeafMessageType::GossipResponse as u8, 9);
        assert_eq!(LeafMessageType::GossipSession as u8, 10);
        for value in 0..=10u8 {
            assert_eq!(LeafMessageType::try_from(value).unwrap() as u8, value);
        }
    }

    #[test]
    fn test_control_frame() {
        let frame = control_frame(LeafMessageType::FullSyncEnd);
        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, LeafMessageType::FullSyncEnd);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert!(matches!(decode_frame(&[]), Err(LeafError::EmptyFrame)));
        assert!(matches!(decode_frame(&[1, 2, 42]), Err(LeafError::UnknownMessageType(42))));
    }

    #[test]
    fn test_register_response() {
        let frame = encode_frame(LeafMessageType::Register, &RegisterResponse::failed("nope")).unwrap();
        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, LeafMessageType::Register);
        let response: RegisterResponse = decode_payload(payload).unwrap();
        assert!(!response.success);
        assert_eq!(response.error, "nope");
        assert!(RegisterResponse::ok().success);
    }

    #[test]
    fn test_only_version_mismatch_is_fatal() {
        assert!(LeafError::VersionMismatch("1.0 vs 2.0".into()).is_fatal());
        assert!(!LeafError::Closed.is_fatal());
        assert!(!LeafError::Link("reset".into()).is_fatal());
    }
}
