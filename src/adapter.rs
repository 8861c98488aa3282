//! Protocol adapter contract — component H.
//!
//! A [`ProtocolAdapter`] is the pluggable boundary between the gateway's
//! internal, protocol-agnostic [`Envelope`] representation and whatever
//! wire format a specific upstream agent speaks. Adapters for specific
//! agent-to-agent or tool-calling protocols are out of scope here — this
//! module defines only the contract plus one reference implementation that
//! round-trips a plain JSON envelope, in the spirit of the hand-written
//! tagged-union (de)serialization this crate's lineage uses for its own
//! streaming response type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};
use crate::types::{CanonicalMethod, Envelope};

/// The result of decoding a response or a single stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterOutcome {
    /// A terminal or intermediate result payload.
    Result(Envelope),
    /// An out-of-band notification (e.g. a status update on a streamed call).
    Notification(Envelope),
    /// The remote agent reported an error.
    Error {
        message: String,
        data: Option<Value>,
    },
}

/// Translates between the gateway's internal envelope representation and a
/// specific agent wire protocol.
///
/// Implementations must be pure with respect to `encode_request` /
/// `decode_response` — no I/O, no shared mutable state — so that
/// `decode(encode(x)) == x` holds for round-trippable envelopes.
pub trait ProtocolAdapter: Send + Sync {
    /// Serialize a canonical method call against the given envelope into a
    /// request body.
    fn encode_request(
        &self,
        method: CanonicalMethod,
        envelope: &Envelope,
    ) -> GatewayResult<Vec<u8>>;

    /// Decode a unary response body.
    fn decode_response(&self, body: &[u8]) -> GatewayResult<AdapterOutcome>;

    /// Decode one already-delimited SSE frame (joined `data:` lines with the
    /// leading `data:`/comment framing already stripped by the ingress
    /// parser).
    fn decode_stream_event(&self, frame: &[u8]) -> GatewayResult<AdapterOutcome>;
}

#[derive(Debug, Serialize, Deserialize)]
struct WireRequest<'a> {
    method: &'a str,
    envelope: &'a Envelope,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireOutcome {
    Result { envelope: Envelope },
    Notification { envelope: Envelope },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

fn method_name(method: CanonicalMethod) -> &'static str {
    match method {
        CanonicalMethod::Send => "send",
        CanonicalMethod::Stream => "stream",
        CanonicalMethod::Cancel => "cancel",
        CanonicalMethod::GetTask => "get_task",
    }
}

/// Reference adapter: a flat JSON envelope with no wire-format translation
/// beyond tagging the outcome kind. Suitable for agents that simply speak
/// the gateway's own envelope shape directly; anything else needs its own
/// `ProtocolAdapter` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEnvelopeAdapter;

impl ProtocolAdapter for JsonEnvelopeAdapter {
    fn encode_request(
        &self,
        method: CanonicalMethod,
        envelope: &Envelope,
    ) -> GatewayResult<Vec<u8>> {
        let wire = WireRequest {
            method: method_name(method),
            envelope,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode_response(&self, body: &[u8]) -> GatewayResult<AdapterOutcome> {
        let outcome: WireOutcome = serde_json::from_slice(body)
            .map_err(|e| GatewayError::InvalidJson(e.to_string()))?;
        Ok(match outcome {
            WireOutcome::Result { envelope } => AdapterOutcome::Result(envelope),
            WireOutcome::Notification { envelope } => AdapterOutcome::Notification(envelope),
            WireOutcome::Error { message, data } => AdapterOutcome::Error { message, data },
        })
    }

    fn decode_stream_event(&self, frame: &[u8]) -> GatewayResult<AdapterOutcome> {
        // The reference adapter treats stream frames identically to unary
        // response bodies — both are a tagged `WireOutcome` envelope.
        self.decode_response(frame)
    }
}
