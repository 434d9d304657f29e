//! Wire framing for subscribe requests and inbound frames.
//!
//! Outbound, every subscription is one JSON-RPC request whose `id` is the
//! subscription id:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"subscribe","id":3,"params":{"query":"tm.event='NewBlock'"}}
//! ```
//!
//! Inbound frames are JSON-RPC responses carrying the same id. Any non-null
//! `result` decodes as an event for that subscription. The first response
//! after each subscribe may be an empty-object acknowledgement; telling that
//! apart from an event needs per-subscription state, so the multiplexer does
//! it with [`is_ack_payload`].

use serde_json::{json, Value};

use chainrelay_core::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, TransportError};

use crate::subscriptions::SubscriptionId;

pub(crate) const SUBSCRIBE_METHOD: &str = "subscribe";

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Result payload for a subscription.
    Event {
        subscription_id: SubscriptionId,
        payload: Value,
    },
    /// The node reported an error in the response envelope.
    EnvelopeError {
        subscription_id: Option<SubscriptionId>,
        error: JsonRpcError,
    },
}

/// Serialize the subscribe request for `id`.
pub fn subscribe_request(id: SubscriptionId, query: &str) -> Result<String, TransportError> {
    let req = JsonRpcRequest::with_params(id.0, SUBSCRIBE_METHOD, json!({ "query": query }));
    Ok(serde_json::to_string(&req)?)
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Result<Frame, TransportError> {
    let resp: JsonRpcResponse = serde_json::from_str(text)?;
    let subscription_id = resp.id.as_u64().map(SubscriptionId);

    if let Some(error) = resp.error {
        return Ok(Frame::EnvelopeError {
            subscription_id,
            error,
        });
    }

    let Some(subscription_id) = subscription_id else {
        return Err(TransportError::Other(format!(
            "frame id {} is not a subscription id",
            resp.id
        )));
    };
    match resp.result {
        Some(payload) if !payload.is_null() => Ok(Frame::Event {
            subscription_id,
            payload,
        }),
        _ => Err(TransportError::Other(
            "frame carries neither result nor error".into(),
        )),
    }
}

/// Whether `payload` has the shape of a subscribe acknowledgement.
pub fn is_ack_payload(payload: &Value) -> bool {
    payload.as_object().is_some_and(|map| map.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_request_shape() {
        let text = subscribe_request(SubscriptionId(3), "tm.event='NewBlock'").unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["method"], "subscribe");
        assert_eq!(v["id"], 3);
        assert_eq!(v["params"]["query"], "tm.event='NewBlock'");
    }

    #[test]
    fn event_frame() {
        let frame = decode(r#"{"jsonrpc":"2.0","id":2,"result":{"data":{"height":"7"}}}"#).unwrap();
        match frame {
            Frame::Event {
                subscription_id,
                payload,
            } => {
                assert_eq!(subscription_id, SubscriptionId(2));
                assert_eq!(payload["data"]["height"], "7");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn string_id_is_accepted() {
        let frame = decode(r#"{"jsonrpc":"2.0","id":"5","result":{"data":1}}"#).unwrap();
        assert!(matches!(frame, Frame::Event { subscription_id: SubscriptionId(5), .. }));
    }

    #[test]
    fn empty_result_decodes_as_event() {
        let frame = decode(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                subscription_id: SubscriptionId(1),
                payload: json!({}),
            }
        );
    }

    #[test]
    fn ack_shape() {
        assert!(is_ack_payload(&json!({})));
        assert!(!is_ack_payload(&json!({ "data": 1 })));
        assert!(!is_ack_payload(&json!([])));
        assert!(!is_ack_payload(&json!("")));
    }

    #[test]
    fn envelope_error() {
        let frame = decode(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32603,"message":"subscription limit"}}"#,
        )
        .unwrap();
        match frame {
            Frame::EnvelopeError {
                subscription_id,
                error,
            } => {
                assert_eq!(subscription_id, Some(SubscriptionId(4)));
                assert_eq!(error.code, -32603);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"jsonrpc":"2.0","id":"abc","result":{"x":1}}"#).is_err());
        assert!(decode(r#"{"jsonrpc":"2.0","id":1}"#).is_err());
        assert!(decode(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).is_err());
    }
}
