// Inbound Frame Decoding
// Venue-neutral envelope parsing: book snapshots/deltas vs. control messages

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Snapshot,
    Delta,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Snapshot => write!(f, "snapshot"),
            FrameKind::Delta => write!(f, "delta"),
        }
    }
}

/// Book payload as emitted by `StreamConnection`.
///
/// Levels are kept as raw JSON arrays; the normalizer owns numeric validation.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub kind: FrameKind,
    /// Venue sequence id, or a locally assigned one when the venue sends none
    pub sequence_id: u64,
    pub prev_sequence_id: Option<u64>,
    pub venue_timestamp: Option<DateTime<Utc>>,
    pub symbol: String,
    pub bids: Vec<Vec<Value>>,
    pub asks: Vec<Vec<Value>>,
    pub received_at: Instant,
    pub received_wall: DateTime<Utc>,
    /// Connection session this frame was read in
    pub session: u64,
}

impl RawFrame {
    /// Milliseconds between the venue stamp and local receipt, if stamped
    pub fn venue_transit_ms(&self) -> Option<f64> {
        self.venue_timestamp
            .map(|ts| (self.received_wall - ts).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RawFrame(kind={}, seq={}, symbol={}, bids={}, asks={}, session={})",
            self.kind,
            self.sequence_id,
            self.symbol,
            self.bids.len(),
            self.asks.len(),
            self.session
        )
    }
}

/// Book frame before sequence assignment
#[derive(Debug, Clone)]
pub struct BookFrame {
    pub kind: FrameKind,
    pub sequence_id: Option<u64>,
    pub prev_sequence_id: Option<u64>,
    pub venue_timestamp: Option<DateTime<Utc>>,
    pub symbol: Option<String>,
    pub bids: Vec<Vec<Value>>,
    pub asks: Vec<Vec<Value>>,
}

impl BookFrame {
    pub fn into_raw(
        self,
        sequence_id: u64,
        default_symbol: &str,
        received_at: Instant,
        received_wall: DateTime<Utc>,
        session: u64,
    ) -> RawFrame {
        RawFrame {
            kind: self.kind,
            sequence_id,
            prev_sequence_id: self.prev_sequence_id,
            venue_timestamp: self.venue_timestamp,
            symbol: self.symbol.unwrap_or_else(|| default_symbol.to_string()),
            bids: self.bids,
            asks: self.asks,
            received_at,
            received_wall,
            session,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Login { success: bool, code: String },
    Subscribe,
    Error { code: String, message: String },
    Pong,
    Other(String),
}

#[derive(Debug, Clone)]
pub enum Decoded {
    Book(BookFrame),
    Control(ControlMessage),
    Corrupt(String),
}

// ============================================================================
// Decoding
// ============================================================================

/// Classify and decode one text frame.
///
/// Accepts a flat `{type|action, seq|seqId, prev_seq|prevSeqId, timestamp|ts,
/// symbol, bids, asks}` body or a wrapped `{arg, action, data: [{..}]}` one.
pub fn decode_frame(text: &str) -> Decoded {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("pong") {
        return Decoded::Control(ControlMessage::Pong);
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => return Decoded::Corrupt(format!("invalid JSON: {}", e)),
    };
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Decoded::Corrupt("frame is not a JSON object".to_string()),
    };

    if let Some(event) = obj.get("event").and_then(Value::as_str) {
        return Decoded::Control(decode_control(event, obj));
    }

    // Wrapped envelope: metadata on the outside, book in data[0]
    let (body, outer) = match obj.get("data").and_then(Value::as_array) {
        Some(data) => match data.first().and_then(Value::as_object) {
            Some(inner) => (inner, Some(obj)),
            None => return Decoded::Corrupt("empty data array".to_string()),
        },
        None => (obj, None),
    };

    let lookup = |keys: &[&str]| lookup_field(body, outer, keys);

    let bids = match body.get("bids").and_then(Value::as_array) {
        Some(levels) => levels.iter().map(level_entries).collect(),
        None => return Decoded::Corrupt("missing bids array".to_string()),
    };
    let asks = match body.get("asks").and_then(Value::as_array) {
        Some(levels) => levels.iter().map(level_entries).collect(),
        None => return Decoded::Corrupt("missing asks array".to_string()),
    };

    let kind = match lookup(&["type", "action"]).and_then(Value::as_str) {
        None => FrameKind::Snapshot,
        Some(t) => match t.to_ascii_lowercase().as_str() {
            "snapshot" | "partial" | "book" => FrameKind::Snapshot,
            "update" | "delta" | "incremental" => FrameKind::Delta,
            other => return Decoded::Corrupt(format!("unknown frame type '{}'", other)),
        },
    };

    let symbol = lookup(&["symbol", "instId"])
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            outer
                .and_then(|o| o.get("arg"))
                .and_then(|arg| arg.get("instId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

    Decoded::Book(BookFrame {
        kind,
        sequence_id: lookup(&["seq", "seqId", "sequence", "sequence_id"]).and_then(parse_u64),
        prev_sequence_id: lookup(&["prev_seq", "prevSeqId", "prev_sequence_id"]).and_then(parse_u64),
        venue_timestamp: lookup(&["timestamp", "ts"]).and_then(parse_timestamp),
        symbol,
        bids,
        asks,
    })
}

/// First matching key in the body, then in the outer envelope
fn lookup_field<'a>(
    body: &'a Map<String, Value>,
    outer: Option<&'a Map<String, Value>>,
    keys: &[&str],
) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| body.get(*k))
        .or_else(|| outer.and_then(|o| keys.iter().find_map(|k| o.get(*k))))
}

fn decode_control(event: &str, obj: &Map<String, Value>) -> ControlMessage {
    let code = obj
        .get("code")
        .map(|c| match c {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| "0".to_string());

    match event {
        "login" => ControlMessage::Login { success: code == "0", code },
        "subscribe" => ControlMessage::Subscribe,
        "error" => ControlMessage::Error {
            code,
            message: obj
                .get("msg")
                .or_else(|| obj.get("message"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        other => ControlMessage::Other(other.to_string()),
    }
}

/// A level is an array; anything else becomes an empty level the normalizer rejects
fn level_entries(level: &Value) -> Vec<Value> {
    level.as_array().cloned().unwrap_or_default()
}

/// Non-negative integer from a number or digit string. Negative means "absent".
fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Epoch milliseconds (number or digit string; µs/ns scaled down) or RFC 3339
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let from_epoch = |raw: i64| {
        let millis = match raw.unsigned_abs() {
            n if n >= 100_000_000_000_000_000 => raw / 1_000_000,
            n if n >= 100_000_000_000_000 => raw / 1_000,
            _ => raw,
        };
        Utc.timestamp_millis_opt(millis).single()
    };

    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        Value::String(s) => {
            let s = s.trim();
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse::<i64>().ok().and_then(from_epoch)
            } else {
                DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book(decoded: Decoded) -> BookFrame {
        match decoded {
            Decoded::Book(frame) => frame,
            other => panic!("expected book frame, got {:?}", other),
        }
    }

    #[test]
    fn test_flat_snapshot_without_type_or_seq() {
        let frame = book(decode_frame(
            r#"{"timestamp":"2025-05-04T10:39:13Z","exchange":"OKX","symbol":"BTC-USDT-SWAP",
                "asks":[["95445.5","9.06"],["95448","2.05"]],"bids":[["95445.4","1104.23"]]}"#,
        ));
        assert_eq!(frame.kind, FrameKind::Snapshot);
        assert_eq!(frame.sequence_id, None);
        assert_eq!(frame.symbol.as_deref(), Some("BTC-USDT-SWAP"));
        assert_eq!(frame.asks.len(), 2);
        assert_eq!(frame.bids[0][0], Value::String("95445.4".to_string()));
        let ts = frame.venue_timestamp.unwrap();
        assert_eq!(ts.timestamp(), 1746355153);
    }

    #[test]
    fn test_flat_delta_with_aliases() {
        let frame = book(decode_frame(
            r#"{"action":"update","seqId":12,"prevSeqId":11,"ts":"1700000000000","bids":[[100,1]],"asks":[]}"#,
        ));
        assert_eq!(frame.kind, FrameKind::Delta);
        assert_eq!(frame.sequence_id, Some(12));
        assert_eq!(frame.prev_sequence_id, Some(11));
        assert_eq!(frame.venue_timestamp.unwrap().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_wrapped_envelope() {
        let frame = book(decode_frame(
            r#"{"arg":{"channel":"books","instId":"ETH-USDT-SWAP"},"action":"snapshot",
                "data":[{"asks":[["2000","1","0","1"]],"bids":[["1999","2","0","3"]],"ts":1700000000000,"seqId":5,"prevSeqId":-1}]}"#,
        ));
        assert_eq!(frame.kind, FrameKind::Snapshot);
        assert_eq!(frame.symbol.as_deref(), Some("ETH-USDT-SWAP"));
        assert_eq!(frame.sequence_id, Some(5));
        assert_eq!(frame.prev_sequence_id, None);
        assert_eq!(frame.asks[0].len(), 4);
    }

    #[test]
    fn test_control_messages() {
        assert!(matches!(decode_frame("pong"), Decoded::Control(ControlMessage::Pong)));
        assert!(matches!(
            decode_frame(r#"{"event":"subscribe","arg":{"channel":"books"}}"#),
            Decoded::Control(ControlMessage::Subscribe)
        ));
        match decode_frame(r#"{"event":"login","code":"0","msg":""}"#) {
            Decoded::Control(ControlMessage::Login { success, .. }) => assert!(success),
            other => panic!("unexpected {:?}", other),
        }
        match decode_frame(r#"{"event":"error","code":"60009","msg":"Login failed."}"#) {
            Decoded::Control(ControlMessage::Error { code, message }) => {
                assert_eq!(code, "60009");
                assert_eq!(message, "Login failed.");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_frames() {
        assert!(matches!(decode_frame("{not json"), Decoded::Corrupt(_)));
        assert!(matches!(decode_frame("[1,2,3]"), Decoded::Corrupt(_)));
        assert!(matches!(decode_frame(r#"{"bids":[]}"#), Decoded::Corrupt(_)));
        assert!(matches!(decode_frame(r#"{"type":"trade","bids":[],"asks":[]}"#), Decoded::Corrupt(_)));
        assert!(matches!(decode_frame(r#"{"data":[]}"#), Decoded::Corrupt(_)));
    }

    #[test]
    fn test_timestamp_units() {
        let ms = parse_timestamp(&serde_json::json!(1_700_000_000_123i64)).unwrap();
        let us = parse_timestamp(&serde_json::json!(1_700_000_000_123_000i64)).unwrap();
        let ns = parse_timestamp(&serde_json::json!(1_700_000_000_123_000_000i64)).unwrap();
        assert_eq!(ms, us);
        assert_eq!(ms, ns);
        assert!(parse_timestamp(&serde_json::json!("yesterday")).is_none());
    }
}
