//! The `Timer` value object: identity, schedule, replica list, callback
//! target, and its external JSON and hex-id wire forms (§3, §4.1).

use crate::errors::TimerParseError;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};

pub const DEFAULT_REPLICATION_FACTOR: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    pub id: u64,
    pub start_time_ms: u64,
    pub interval_ms: u64,
    pub repeat_for_ms: u64,
    pub sequence_number: u64,
    pub replicas: Vec<String>,
    pub replication_factor: usize,
    pub callback_url: String,
    pub callback_body: String,
    pub tombstone: bool,
}

impl Timer {
    /// §4.1: `start_time + (sequence_number + 1) * interval_ms`.
    pub fn next_pop_time(&self) -> u64 {
        self.start_time_ms + (self.sequence_number + 1) * self.interval_ms
    }

    /// §3: the k-th pop (k = sequence_number after incrementing) is allowed
    /// iff `k * interval_ms <= repeat_for_ms`.
    pub fn should_repeat_after(&self, sequence_number: u64) -> bool {
        sequence_number * self.interval_ms <= self.repeat_for_ms
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone
    }

    /// §4.1: flips the flag and shortens `repeat_for_ms` to `interval_ms`,
    /// so the tombstone pops exactly once more and is then evicted.
    pub fn become_tombstone(&mut self) {
        self.tombstone = true;
        self.repeat_for_ms = self.interval_ms;
    }

    pub fn is_local(&self, addr: &str) -> bool {
        self.replicas.iter().any(|r| r == addr)
    }

    /// §4.1: `http://<replica>:<port>/timers/<32-hex>`.
    pub fn url(&self, host: &str, bloom_hash: u64) -> String {
        format!("http://{host}/timers/{}", encode_hex_id(self.id, bloom_hash))
    }

    pub fn to_json(&self) -> TimerJson {
        TimerJson {
            timing: TimingJson {
                interval: self.interval_ms,
                repeat_for: self.repeat_for_ms,
                start_time_delta: None,
                start_time: Some(self.start_time_ms),
                sequence_number: Some(self.sequence_number),
            },
            callback: CallbackJson {
                http: HttpCallbackJson {
                    uri: self.callback_url.clone(),
                    opaque: self.callback_body.clone(),
                },
            },
            reliability: ReliabilityJson {
                replication_factor: Some(self.replication_factor),
                replicas: if self.replicas.is_empty() {
                    None
                } else {
                    Some(self.replicas.clone())
                },
            },
            tombstone: self.tombstone,
        }
    }

    /// §4.1: parses a client- or peer-supplied body, resolving the replica
    /// list per the selection algorithm. Returns the timer plus whether the
    /// caller should skip replicating it themselves (it was pre-replicated
    /// or arrived with an explicit replica list already).
    pub fn from_json(
        id: u64,
        bloom_hash: u64,
        body: &TimerJson,
        topology: &Topology,
        now_ms: u64,
    ) -> Result<(Timer, bool), TimerParseError> {
        let start_time_ms = body
            .timing
            .start_time
            .unwrap_or_else(|| now_ms + body.timing.start_time_delta.unwrap_or(0));

        let (replicas, replication_factor, already_replicated) =
            match &body.reliability.replicas {
                Some(replicas) if !replicas.is_empty() => {
                    (replicas.clone(), replicas.len(), true)
                }
                _ => {
                    let factor = body
                        .reliability
                        .replication_factor
                        .unwrap_or(DEFAULT_REPLICATION_FACTOR);
                    let replicas = topology.select_replicas(id, bloom_hash, factor);
                    (replicas, factor, false)
                }
            };

        Ok((
            Timer {
                id,
                start_time_ms,
                interval_ms: body.timing.interval,
                repeat_for_ms: body.timing.repeat_for,
                sequence_number: body.timing.sequence_number.unwrap_or(0),
                replicas,
                replication_factor,
                callback_url: body.callback.http.uri.clone(),
                callback_body: body.callback.http.opaque.clone(),
                tombstone: body.tombstone,
            },
            already_replicated,
        ))
    }
}

/// §4.1 external JSON schema — parsed first into this loosely-typed form so
/// malformed fields (wrong JSON type) can be distinguished from simply
/// absent ones, per the strict parsing rules.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerJson {
    pub timing: TimingJson,
    pub callback: CallbackJson,
    #[serde(default)]
    pub reliability: ReliabilityJson,
    #[serde(default)]
    pub tombstone: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingJson {
    pub interval: u64,
    #[serde(rename = "repeat-for")]
    pub repeat_for: u64,
    #[serde(rename = "start-time-delta", skip_serializing_if = "Option::is_none")]
    pub start_time_delta: Option<u64>,
    /// Not part of the client-facing schema; carried internally so
    /// `to_json` round-trips through `from_json` exactly (§8 round-trip
    /// property) and so replica PUTs transmit the original absolute start
    /// time rather than reinterpreting a relative delta.
    #[serde(rename = "start-time", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<u64>,
    #[serde(rename = "sequence-number", skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackJson {
    pub http: HttpCallbackJson,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpCallbackJson {
    pub uri: String,
    pub opaque: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReliabilityJson {
    #[serde(rename = "replication-factor", skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<Vec<String>>,
}

/// Parses raw bytes into a [`TimerJson`], translating serde's untyped
/// failures into the specific §4.1 `TimerParseError` variants so 400
/// responses carry a precise message.
pub fn parse_timer_json(body: &[u8]) -> Result<TimerJson, TimerParseError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| TimerParseError::InvalidJson(e.to_string()))?;

    let timing = value
        .get("timing")
        .ok_or_else(|| TimerParseError::InvalidJson("missing timing".into()))?;
    if !timing
        .get("interval")
        .map(|v| v.is_u64())
        .unwrap_or(false)
    {
        return Err(TimerParseError::BadInterval);
    }
    if !timing
        .get("repeat-for")
        .map(|v| v.is_u64())
        .unwrap_or(false)
    {
        return Err(TimerParseError::BadRepeatFor);
    }

    let callback = value
        .get("callback")
        .and_then(|c| c.get("http"))
        .ok_or(TimerParseError::MissingUri)?;
    if !callback.get("uri").map(|v| v.is_string()).unwrap_or(false) {
        return Err(TimerParseError::MissingUri);
    }
    if !callback
        .get("opaque")
        .map(|v| v.is_string())
        .unwrap_or(false)
    {
        return Err(TimerParseError::MissingOpaque);
    }

    if let Some(reliability) = value.get("reliability") {
        if let Some(rf) = reliability.get("replication-factor") {
            if !rf.is_u64() {
                return Err(TimerParseError::BadReplicationFactor);
            }
        }
        if let Some(replicas) = reliability.get("replicas") {
            if !replicas.is_array() {
                return Err(TimerParseError::BadReplicas);
            }
        }
    }

    serde_json::from_value(value).map_err(|e| TimerParseError::InvalidJson(e.to_string()))
}

/// §6: 32 lowercase hex characters — 8-byte id (big-endian) followed by the
/// 8-byte bloom hash (big-endian). (§4.1 describes this as "12 bytes / 24
/// hex chars" in one place and "bytes 0-7 / bytes 8-15" in another; this
/// crate follows the byte-range description, which unambiguously specifies
/// 16 bytes. See DESIGN.md.)
pub fn encode_hex_id(id: u64, bloom_hash: u64) -> String {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&id.to_be_bytes());
    bytes[8..16].copy_from_slice(&bloom_hash.to_be_bytes());
    hex::encode(bytes)
}

/// Inverse of [`encode_hex_id`]. The bloom portion is advisory (§6): it
/// need not match a recomputation from current membership.
pub fn decode_hex_id(hex_str: &str) -> Option<(u64, u64)> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 16 {
        return None;
    }
    let id = u64::from_be_bytes(bytes[0..8].try_into().ok()?);
    let bloom_hash = u64::from_be_bytes(bytes[8..16].try_into().ok()?);
    Some((id, bloom_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeInfo;

    fn topology() -> Topology {
        Topology {
            local: NodeInfo {
                addr: "a:1".into(),
                signature: 1,
            },
            nodes: vec![
                NodeInfo {
                    addr: "a:1".into(),
                    signature: 1,
                },
                NodeInfo {
                    addr: "b:1".into(),
                    signature: 2,
                },
            ],
            bloom_bits: 1,
            default_replication_factor: 2,
        }
    }

    #[test]
    fn hex_id_round_trips() {
        let hex_str = encode_hex_id(0x0102030405060708, 0x090a0b0c0d0e0f10);
        assert_eq!(hex_str.len(), 32);
        let (id, hash) = decode_hex_id(&hex_str).unwrap();
        assert_eq!(id, 0x0102030405060708);
        assert_eq!(hash, 0x090a0b0c0d0e0f10);
    }

    #[test]
    fn rejects_non_numeric_interval() {
        let body = br#"{"timing":{"interval":"hi","repeat-for":200},"callback":{"http":{"uri":"http://x","opaque":"y"}}}"#;
        assert_eq!(parse_timer_json(body), Err(TimerParseError::BadInterval));
    }

    #[test]
    fn rejects_missing_callback() {
        let body = br#"{"timing":{"interval":1,"repeat-for":200}}"#;
        assert_eq!(parse_timer_json(body), Err(TimerParseError::MissingUri));
    }

    #[test]
    fn explicit_replicas_skip_selection_and_set_factor() {
        let body = parse_timer_json(
            br#"{"timing":{"interval":100,"repeat-for":100},
                 "callback":{"http":{"uri":"http://sink/cb","opaque":"x"}},
                 "reliability":{"replicas":["a:1","b:1"]}}"#,
        )
        .unwrap();
        let (timer, already) = Timer::from_json(1, 0, &body, &topology(), 0).unwrap();
        assert!(already);
        assert_eq!(timer.replicas, vec!["a:1".to_string(), "b:1".to_string()]);
        assert_eq!(timer.replication_factor, 2);
    }

    #[test]
    fn default_replication_factor_is_two() {
        let body = parse_timer_json(
            br#"{"timing":{"interval":100,"repeat-for":100},
                 "callback":{"http":{"uri":"http://sink/cb","opaque":"x"}},
                 "reliability":{}}"#,
        )
        .unwrap();
        let (timer, already) = Timer::from_json(1, 0, &body, &topology(), 0).unwrap();
        assert!(!already);
        assert_eq!(timer.replication_factor, 2);
    }

    #[test]
    fn json_round_trip_preserves_scheduling_and_callback_fields() {
        let body = parse_timer_json(
            br#"{"timing":{"interval":100,"repeat-for":300},
                 "callback":{"http":{"uri":"http://sink/cb","opaque":"x"}},
                 "reliability":{"replicas":["a:1","b:1"]}}"#,
        )
        .unwrap();
        let (timer, _) = Timer::from_json(7, 0, &body, &topology(), 1_000).unwrap();
        let reencoded = timer.to_json();
        let (reparsed, _) = Timer::from_json(7, 0, &reencoded, &topology(), 1_000).unwrap();
        assert_eq!(timer.interval_ms, reparsed.interval_ms);
        assert_eq!(timer.repeat_for_ms, reparsed.repeat_for_ms);
        assert_eq!(timer.start_time_ms, reparsed.start_time_ms);
        assert_eq!(timer.callback_url, reparsed.callback_url);
        assert_eq!(timer.callback_body, reparsed.callback_body);
        assert_eq!(timer.replicas, reparsed.replicas);
    }

    #[test]
    fn tombstone_shortens_repeat_for_to_interval() {
        let mut timer = Timer {
            id: 1,
            start_time_ms: 0,
            interval_ms: 100,
            repeat_for_ms: 500,
            sequence_number: 2,
            replicas: vec!["a:1".into()],
            replication_factor: 1,
            callback_url: "http://x".into(),
            callback_body: "y".into(),
            tombstone: false,
        };
        timer.become_tombstone();
        assert!(timer.is_tombstone());
        assert_eq!(timer.repeat_for_ms, 100);
    }

    #[test]
    fn kth_pop_allowed_iff_within_window() {
        let timer = Timer {
            id: 1,
            start_time_ms: 0,
            interval_ms: 100,
            repeat_for_ms: 250,
            sequence_number: 0,
            replicas: vec![],
            replication_factor: 1,
            callback_url: "http://x".into(),
            callback_body: "y".into(),
            tombstone: false,
        };
        assert!(timer.should_repeat_after(1)); // 100 <= 250
        assert!(timer.should_repeat_after(2)); // 200 <= 250
        assert!(!timer.should_repeat_after(3)); // 300 > 250
    }
}
