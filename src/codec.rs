//! JSON wire codec for [`Envelope`]s.
//!
//! One logical message is one JSON object. [`encode`] and [`decode`] map
//! between envelopes and bytes; [`peek`] reads only the discriminator and
//! `reqId` so a receive loop can route a message before paying for full
//! deserialization. A missing or unknown discriminator is a decode error,
//! reported to the caller rather than silently dropped.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

use crate::envelope::{Envelope, EnvelopeHead, EnvelopeKind, ErrorInfo, ReqId, RequestItem};

/// Errors produced while encoding or decoding envelopes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The bytes were not a JSON object in the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    /// The object carried no `type` discriminator.
    #[error("envelope is missing the `type` discriminator")]
    MissingDiscriminator,
    /// The `type` discriminator named no known message kind.
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    /// A field required by the message kind was absent.
    #[error("`{kind}` envelope is missing required field `{field}`")]
    MissingField {
        /// Kind of the offending envelope.
        kind: EnvelopeKind,
        /// Wire name of the absent field.
        field: &'static str,
    },
    /// Serializing an envelope failed.
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Inbound wire shape: a superset of all envelope kinds.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireIn {
    #[serde(rename = "type")]
    kind: Option<String>,
    req_id: Option<ReqId>,
    payload: Option<Box<RawValue>>,
    error: Option<ErrorInfo>,
    event: Option<String>,
    requests: Option<Vec<RequestItem>>,
}

/// Outbound wire shape; absent fields are omitted, which gives events their
/// reduced encoding.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireOut<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    req_id: Option<ReqId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requests: Option<&'a [RequestItem]>,
}

impl WireOut<'_> {
    fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind: kind.as_str(),
            req_id: None,
            payload: None,
            error: None,
            event: None,
            requests: None,
        }
    }
}

/// Serialize an envelope to JSON bytes.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let mut out = WireOut::new(envelope.kind());
    match envelope {
        Envelope::Request { req_id, payload } | Envelope::Response { req_id, payload } => {
            out.req_id = Some(*req_id);
            out.payload = Some(payload);
        }
        Envelope::Batch { requests } => out.requests = Some(requests),
        Envelope::Error { req_id, error } => {
            out.req_id = Some(*req_id);
            out.error = Some(error);
        }
        Envelope::Event { name, payload } => {
            out.event = Some(name);
            out.payload = payload.as_deref();
        }
        Envelope::Cancel { req_id } => out.req_id = Some(*req_id),
    }
    serde_json::to_vec(&out).map_err(CodecError::Encode)
}

/// Deserialize an envelope from JSON bytes.
///
/// # Errors
///
/// Returns [`CodecError::Malformed`] when the bytes are not an envelope
/// object, [`CodecError::MissingDiscriminator`] / [`CodecError::UnknownKind`]
/// for a bad `type` field, and [`CodecError::MissingField`] when a field the
/// message kind requires is absent.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let wire: WireIn = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
    let kind = resolve_kind(wire.kind.as_deref())?;

    let require_req_id = |req_id: Option<ReqId>| {
        req_id.ok_or(CodecError::MissingField {
            kind,
            field: "reqId",
        })
    };

    match kind {
        EnvelopeKind::Request => Ok(Envelope::Request {
            req_id: require_req_id(wire.req_id)?,
            payload: wire.payload.ok_or(CodecError::MissingField {
                kind,
                field: "payload",
            })?,
        }),
        EnvelopeKind::Batch => Ok(Envelope::Batch {
            requests: wire.requests.ok_or(CodecError::MissingField {
                kind,
                field: "requests",
            })?,
        }),
        EnvelopeKind::Response => Ok(Envelope::Response {
            req_id: require_req_id(wire.req_id)?,
            payload: wire.payload.ok_or(CodecError::MissingField {
                kind,
                field: "payload",
            })?,
        }),
        EnvelopeKind::Error => Ok(Envelope::Error {
            req_id: require_req_id(wire.req_id)?,
            error: wire.error.ok_or(CodecError::MissingField {
                kind,
                field: "error",
            })?,
        }),
        EnvelopeKind::Event => Ok(Envelope::Event {
            name: wire.event.ok_or(CodecError::MissingField {
                kind,
                field: "event",
            })?,
            payload: wire.payload,
        }),
        EnvelopeKind::Cancel => Ok(Envelope::Cancel {
            req_id: require_req_id(wire.req_id)?,
        }),
    }
}

/// Read the discriminator and `reqId` without touching the payload.
///
/// # Errors
///
/// Fails with the same discriminator errors as [`decode`]; the payload is
/// skipped, not validated.
pub fn peek(bytes: &[u8]) -> Result<EnvelopeHead, CodecError> {
    #[derive(Deserialize)]
    struct WireHead {
        #[serde(rename = "type")]
        kind: Option<String>,
        #[serde(rename = "reqId")]
        req_id: Option<ReqId>,
    }

    let head: WireHead = serde_json::from_slice(bytes).map_err(CodecError::Malformed)?;
    let kind = resolve_kind(head.kind.as_deref())?;
    Ok(EnvelopeHead {
        kind,
        req_id: head.req_id,
    })
}

fn resolve_kind(kind: Option<&str>) -> Result<EnvelopeKind, CodecError> {
    let kind = kind.ok_or(CodecError::MissingDiscriminator)?;
    EnvelopeKind::from_wire(kind).ok_or_else(|| CodecError::UnknownKind(kind.to_owned()))
}
