//! # Signalling Wire Protocol
//!
//! This module defines the serializable message types exchanged on
//! signalling channels and over the HTTP bootstrap endpoint, plus the
//! base58 wrapping used to carry envelopes in URLs.
//!
//! ## Message Types
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `JoinRequest` | peer → relay | Register this peer's id on the relay |
//! | `ConnectRequest` | peer → relay → peer | An offer being relayed toward `dst` |
//! | `ConnectResponse` | peer → relay → peer | The answer travelling back to `src` |
//!
//! Messages are self-describing UTF-8 JSON with a `type` tag, so a single
//! ordered byte duct can interleave them and a forwarding relay can route
//! on `dst` without understanding the inner signal. The inner [`Signal`]
//! envelope carries the engine's opaque payload, base58-encoded so binary
//! payloads survive both the JSON envelope and URL query strings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addr::PeerId;

/// Decode failures surfaced to callers. Callers log and drop; a bad
/// message never takes down a channel.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed signal envelope")]
    MalformedSignal,
    #[error("unrecognised message type {0:?}")]
    UnknownType(String),
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid base58 payload")]
    Base58(#[from] bs58::decode::Error),
}

/// Kind of an offer/answer envelope. Only `Offer` triggers state
/// transitions; the other kinds are forwarded opaquely.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// An offer/answer envelope produced or consumed by the peer engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    #[serde(with = "b58_bytes")]
    pub payload: Vec<u8>,
}

impl Signal {
    pub fn new(kind: SignalKind, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Signalling messages carried on a signalling channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignallingMessage {
    JoinRequest {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    ConnectRequest {
        src: PeerId,
        dst: PeerId,
        signal: Signal,
    },
    ConnectResponse {
        src: PeerId,
        dst: PeerId,
        signal: Signal,
    },
}

impl SignallingMessage {
    /// Routing destination, for everything that is routed.
    pub fn dst(&self) -> Option<&PeerId> {
        match self {
            SignallingMessage::JoinRequest { .. } => None,
            SignallingMessage::ConnectRequest { dst, .. } => Some(dst),
            SignallingMessage::ConnectResponse { dst, .. } => Some(dst),
        }
    }
}

pub fn encode_message(msg: &SignallingMessage) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Decode a signalling message, distinguishing an unknown `type` tag from
/// JSON-level corruption so the caller can report protocol violations.
pub fn decode_message(bytes: &[u8]) -> Result<SignallingMessage, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    let tag = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);
    match serde_json::from_value(value) {
        Ok(msg) => Ok(msg),
        Err(e) => match tag {
            Some(t) if !matches!(t.as_str(), "JoinRequest" | "ConnectRequest" | "ConnectResponse") => {
                Err(CodecError::UnknownType(t))
            }
            _ => Err(CodecError::Json(e)),
        },
    }
}

pub fn encode_signal(signal: &Signal) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(signal)?)
}

/// Decode an offer/answer envelope. JSON that parses but is not a
/// recognised envelope maps to [`CodecError::MalformedSignal`].
pub fn decode_signal(bytes: &[u8]) -> Result<Signal, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    serde_json::from_value(value).map_err(|_| CodecError::MalformedSignal)
}

/// Signalling-channel type tag carried in the `signalling_channel` query
/// parameter. Absent means `None`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ScKind {
    #[default]
    None,
    Peer,
    Relay,
}

impl ScKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScKind::None => "none",
            ScKind::Peer => "peer",
            ScKind::Relay => "relay",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ScKind::None),
            "peer" => Some(ScKind::Peer),
            "relay" => Some(ScKind::Relay),
            _ => None,
        }
    }
}

/// base58 wrapping for the HTTP transport (binary-safe for URL use).
pub fn to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

pub fn from_base58(s: &str) -> Result<Vec<u8>, CodecError> {
    Ok(bs58::decode(s.trim()).into_vec()?)
}

mod b58_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&bs58::encode(bytes).into_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        bs58::decode(s.as_bytes())
            .into_vec()
            .map_err(serde::de::Error::custom)
    }
}
