// src/protocol.rs
// Pairing protocol frames, per-peer replay protection and the crypto
// envelope applied to every datagram.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::crypto::{AesCipher, RsaKeys};
use crate::util;

/// One protocol frame. The verb is externally tagged, so the wire shape is
/// `{"timestamp":..,"seq":..,"machine_name":"..","pair":{"request":{..}}}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub timestamp: i64,
    pub seq: i64,
    pub machine_name: String,
    #[serde(flatten)]
    pub verb: Verb,
}

impl Frame {
    pub fn new(machine_name: &str, seq: i64, verb: Verb) -> Self {
        Self { timestamp: util::now_ms(), seq, machine_name: machine_name.to_string(), verb }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Broadcast(BroadcastInfo),
    Pair(Exchange<PairRequest, PairResponse>),
    Connect(Exchange<ConnectRequest, ConnectResponse>),
    Reconfigure(Exchange<ReconfigureRequest, ReconfigureResponse>),
    Status(StatusInfo),
    Disconnect(DisconnectInfo),
}

/// Request/response discriminator for verbs that exist in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange<Q, R> {
    Request(Q),
    Response(R),
}

/// "I exist, here's how to reach me" - one entry per ready driver instance.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BroadcastInfo {
    pub drivers: Vec<DriverBroadcast>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverBroadcast {
    pub name: String,
    pub instance: String,
    pub ip: String,
    #[serde(flatten)]
    pub info: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairRequest {
    /// Requester's PEM public key; empty on the simplified path.
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Chosen pairing parameters per driver instance.
    #[serde(default)]
    pub drivers: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairResponse {
    #[serde(default)]
    pub public_key: String,
    /// Parameters the responder accepted, per driver instance.
    #[serde(default)]
    pub accepted: Map<String, Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Connection-section parameters per driver instance.
    #[serde(default)]
    pub drivers: Map<String, Value>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub drivers: Vec<DriverEndpoint>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverEndpoint {
    pub instance: String,
    pub ip: String,
    #[serde(default)]
    pub mavlink_port: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigureRequest {
    pub params: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconfigureResponse {
    pub accepted: bool,
}

/// Heartbeat, one per driver instance carrying the link.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusInfo {
    pub instance: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DisconnectInfo {}

/// Outbound sequence numbers. Seeded from wall-clock milliseconds so a
/// restarted sender stays above any peer's remembered high-water mark.
pub struct SeqCounter {
    next: AtomicI64,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self { next: AtomicI64::new(util::now_ms()) }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for SeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound replay protection: frames whose sequence is not strictly greater
/// than the last accepted one from that peer are discarded.
#[derive(Default)]
pub struct ReplayGuard {
    last_seq: Mutex<HashMap<String, i64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept and remember, or reject a stale sequence.
    pub fn accept(&self, peer: &str, seq: i64) -> bool {
        let mut last = self.last_seq.lock().unwrap();
        match last.get(peer) {
            Some(&prev) if seq <= prev => false,
            _ => {
                last.insert(peer.to_string(), seq);
                true
            }
        }
    }

    /// Drop the stored high-water mark, e.g. after unpairing.
    pub fn forget(&self, peer: &str) {
        self.last_seq.lock().unwrap().remove(peer);
    }
}

/// A decoded frame plus whether its signature checked out.
#[derive(Clone, Debug)]
pub struct OpenedFrame {
    pub frame: Frame,
    pub verified: bool,
}

/// Wrap a frame for the wire. With RSA enabled the frame is signed and, when
/// the recipient's key is known, encrypted to it; otherwise the (signed)
/// payload falls back to AES under the shared key, or plaintext.
pub fn seal(
    frame: &Frame,
    rsa_on: bool,
    own: &RsaKeys,
    peer: Option<&RsaKeys>,
    aes: Option<&AesCipher>,
) -> Result<String, String> {
    let frame_json = serde_json::to_string(frame).map_err(|e| e.to_string())?;

    let payload = if rsa_on {
        let signature = own.sign(&frame_json)?;
        let wrapper = json!({"message": frame_json, "signature": signature}).to_string();
        if let Some(peer) = peer.filter(|p| p.has_public()) {
            let data = peer.encrypt(&wrapper)?;
            return Ok(json!({"rsa_encrypted": true, "data": data}).to_string());
        }
        wrapper
    } else {
        frame_json
    };

    match aes {
        Some(aes) => aes.encrypt(&payload),
        None => Ok(payload),
    }
}

/// Unwrap a datagram. Returns None for anything that fails to parse,
/// decrypt or verify - such frames are silently dropped by design.
pub fn open<F>(
    wire: &str,
    own: &RsaKeys,
    aes: Option<&AesCipher>,
    peer_key: F,
) -> Option<OpenedFrame>
where
    F: Fn(&str) -> Option<RsaKeys>,
{
    let text = wire.trim();

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if value.get("rsa_encrypted").and_then(|v| v.as_bool()) == Some(true) {
            let data = value.get("data")?.as_str()?;
            let wrapper = match own.decrypt(data) {
                Ok(w) => w,
                Err(e) => {
                    log::debug!("dropping undecryptable frame: {}", e);
                    return None;
                }
            };
            let wrapper: Value = serde_json::from_str(&wrapper).ok()?;
            return open_signed(&wrapper, peer_key);
        }
        if value.get("message").is_some() && value.get("signature").is_some() {
            return open_signed(&value, peer_key);
        }
        let frame: Frame = serde_json::from_value(value).ok()?;
        return Some(OpenedFrame { frame, verified: false });
    }

    // not JSON: an AES-wrapped payload, which may itself be a signed wrapper
    let aes = aes?;
    let inner = match aes.decrypt(text) {
        Ok(i) => i,
        Err(e) => {
            log::debug!("dropping undecryptable frame: {}", e);
            return None;
        }
    };
    let value: Value = serde_json::from_str(&inner).ok()?;
    if value.get("message").is_some() && value.get("signature").is_some() {
        return open_signed(&value, peer_key);
    }
    let frame: Frame = serde_json::from_value(value).ok()?;
    Some(OpenedFrame { frame, verified: false })
}

fn open_signed<F>(wrapper: &Value, peer_key: F) -> Option<OpenedFrame>
where
    F: Fn(&str) -> Option<RsaKeys>,
{
    let message = wrapper.get("message")?.as_str()?;
    let signature = wrapper.get("signature")?.as_str()?;
    let frame: Frame = serde_json::from_str(message).ok()?;

    // Prefer the key we already hold for the sender; during pair exchanges
    // fall back to the key embedded in the payload (identity binding).
    let key = peer_key(&frame.machine_name).or_else(|| embedded_key(&frame.verb));

    match key {
        Some(key) => {
            if key.verify(message, signature) {
                Some(OpenedFrame { frame, verified: true })
            } else {
                log::debug!("dropping frame with bad signature from {}", frame.machine_name);
                None
            }
        }
        // no key to check against: pass through unverified, receivers gate
        // per verb
        None => Some(OpenedFrame { frame, verified: false }),
    }
}

fn embedded_key(verb: &Verb) -> Option<RsaKeys> {
    let pem = match verb {
        Verb::Pair(Exchange::Request(q)) => &q.public_key,
        Verb::Pair(Exchange::Response(r)) => &r.public_key,
        _ => return None,
    };
    if pem.is_empty() {
        return None;
    }
    RsaKeys::from_public_pem(pem).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::DEFAULT_SALT;

    fn status_frame(name: &str, seq: i64) -> Frame {
        Frame::new(name, seq, Verb::Status(StatusInfo { instance: "WIFI".to_string() }))
    }

    #[test]
    fn test_wire_shape() {
        let frame = Frame::new(
            "TestGCS",
            7,
            Verb::Pair(Exchange::Request(PairRequest {
                public_key: "PEM".to_string(),
                password: None,
                drivers: Map::new(),
            })),
        );
        let value: Value = serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["machine_name"], "TestGCS");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["pair"]["request"]["public_key"], "PEM");

        let back: Frame = serde_json::from_value(value).unwrap();
        assert!(matches!(back.verb, Verb::Pair(Exchange::Request(_))));
    }

    #[test]
    fn test_replay_guard() {
        let guard = ReplayGuard::new();
        assert!(guard.accept("Vehicle", 10));
        assert!(!guard.accept("Vehicle", 10));
        assert!(!guard.accept("Vehicle", 9));
        assert!(guard.accept("Vehicle", 11));
        // peers are tracked independently
        assert!(guard.accept("Other", 1));

        guard.forget("Vehicle");
        assert!(guard.accept("Vehicle", 1));
    }

    #[test]
    fn test_seq_counter_monotonic() {
        let counter = SeqCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(b > a);
        // seeded near the current wall clock
        assert!(a >= util::now_ms() - 1000);
    }

    #[test]
    fn test_seal_open_plaintext() {
        let own = RsaKeys::generate().unwrap();
        let frame = status_frame("Vehicle", 1);
        let wire = seal(&frame, false, &own, None, None).unwrap();
        let opened = open(&wire, &own, None, |_| None).unwrap();
        assert_eq!(opened.frame.machine_name, "Vehicle");
        assert!(!opened.verified);
    }

    #[test]
    fn test_seal_open_aes() {
        let own = RsaKeys::generate().unwrap();
        let aes = AesCipher::new("1234567890", DEFAULT_SALT, true);
        let frame = status_frame("Vehicle", 2);
        let wire = seal(&frame, false, &own, None, Some(&aes)).unwrap();
        assert!(serde_json::from_str::<Value>(&wire).is_err());

        let opened = open(&wire, &own, Some(&aes), |_| None).unwrap();
        assert_eq!(opened.frame.seq, 2);

        // wrong shared key drops the frame
        let other = AesCipher::new("wrong", DEFAULT_SALT, true);
        assert!(open(&wire, &own, Some(&other), |_| None).is_none());
    }

    #[test]
    fn test_seal_open_rsa() {
        let master = RsaKeys::generate().unwrap();
        let slave = RsaKeys::generate().unwrap();
        let slave_pub = RsaKeys::from_public_pem(&slave.public_key_pem().unwrap()).unwrap();
        let master_pub = RsaKeys::from_public_pem(&master.public_key_pem().unwrap()).unwrap();

        let frame = status_frame("TestGCS", 3);
        let wire = seal(&frame, true, &master, Some(&slave_pub), None).unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["rsa_encrypted"], true);

        // slave decrypts with its private key and verifies with the master's
        let opened = open(&wire, &slave, None, |name| {
            (name == "TestGCS").then(|| master_pub.clone())
        })
        .unwrap();
        assert!(opened.verified);
        assert_eq!(opened.frame.machine_name, "TestGCS");

        // verification against the wrong key drops the frame
        let wrong = RsaKeys::generate().unwrap();
        assert!(open(&wire, &slave, None, |_| Some(wrong.clone())).is_none());
    }

    #[test]
    fn test_pair_request_verifies_with_embedded_key() {
        let master = RsaKeys::generate().unwrap();
        let frame = Frame::new(
            "TestGCS",
            4,
            Verb::Pair(Exchange::Request(PairRequest {
                public_key: master.public_key_pem().unwrap(),
                password: Some("secret".to_string()),
                drivers: Map::new(),
            })),
        );
        // slave has never seen this master: signed but not encrypted
        let wire = seal(&frame, true, &master, None, None).unwrap();
        let slave = RsaKeys::generate().unwrap();
        let opened = open(&wire, &slave, None, |_| None).unwrap();
        assert!(opened.verified);

        // tampering with the signed message drops the frame
        let mut value: Value = serde_json::from_str(&wire).unwrap();
        let tampered = value["message"].as_str().unwrap().replace("TestGCS", "EvilGCS");
        value["message"] = Value::String(tampered);
        assert!(open(&value.to_string(), &slave, None, |_| None).is_none());
    }
}
