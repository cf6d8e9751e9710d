//! Binary wire protocol for CRDT notebook synchronization.
//!
//! Every frame starts with a variable-length unsigned integer message type:
//!
//! ```text
//! ┌──────────┬───────────────────────────────────────────┐
//! │ varint   │ payload                                   │
//! │ msg type │ (varies by type)                          │
//! └──────────┴───────────────────────────────────────────┘
//!
//! SYNC (0)      varint subtype ∈ {step1=0, step2=1, update=2},
//!               then a length-prefixed byte string (state vector or
//!               yrs v1 update).
//! AWARENESS (1) length-prefixed awareness payload (see `awareness`).
//! AUTH (2)      reserved; decoded and ignored.
//! ```
//!
//! Integers are little-endian base-128 varints (7 data bits per byte, high
//! bit = continuation), matching the encoding browser peers speak. The merge
//! algorithm itself lives entirely in `yrs`; this module only frames its
//! state vectors and updates.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Origin, ReadTxn, StateVector, Transact, Update};

/// Frame type tags.
pub const MSG_SYNC: u64 = 0;
pub const MSG_AWARENESS: u64 = 1;
pub const MSG_AUTH: u64 = 2;

/// SYNC subtype tags.
pub const SYNC_STEP1: u64 = 0;
pub const SYNC_STEP2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame could not be decoded (truncated buffer, bogus varint, bad utf-8).
    MalformedFrame(String),
    /// Frame carried a type tag outside the known set.
    UnknownType(u64),
    /// The framed payload was rejected by yrs (bad state vector or update).
    Sync(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedFrame(e) => write!(f, "malformed frame: {e}"),
            Self::UnknownType(t) => write!(f, "unknown message type: {t}"),
            Self::Sync(e) => write!(f, "sync error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ─── varint primitives ──────────────────────────────────────────────

pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push(0x80 | (value & 0x7f) as u8);
        value >>= 7;
    }
    buf.push(value as u8);
}

pub(crate) fn read_var_u64(buf: &[u8], pos: &mut usize) -> Result<u64, ProtocolError> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| ProtocolError::MalformedFrame("truncated varint".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(ProtocolError::MalformedFrame("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub(crate) fn write_buf(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

pub(crate) fn read_buf<'a>(buf: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ProtocolError> {
    let len = read_var_u64(buf, pos)? as usize;
    let end = pos
        .checked_add(len)
        .ok_or_else(|| ProtocolError::MalformedFrame("length overflow".into()))?;
    if end > buf.len() {
        return Err(ProtocolError::MalformedFrame("truncated byte string".into()));
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

pub(crate) fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_buf(buf, s.as_bytes());
}

pub(crate) fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    let bytes = read_buf(buf, pos)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid utf-8: {e}")))
}

// ─── message family ─────────────────────────────────────────────────

/// A SYNC frame's submessage. Payloads stay opaque here; `yrs` decodes them
/// when the message is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector announcement; the receiver replies with the missing diff.
    Step1(Vec<u8>),
    /// State-as-update reply to a step 1.
    Step2(Vec<u8>),
    /// Incremental document update.
    Update(Vec<u8>),
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Raw awareness payload; `awareness::AwarenessUpdate` decodes it.
    Awareness(Vec<u8>),
    /// Reserved. Carried payload is dropped.
    Auth,
}

impl Message {
    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match self {
            Message::Sync(sync) => {
                write_var_u64(&mut buf, MSG_SYNC);
                match sync {
                    SyncMessage::Step1(sv) => {
                        write_var_u64(&mut buf, SYNC_STEP1);
                        write_buf(&mut buf, sv);
                    }
                    SyncMessage::Step2(update) => {
                        write_var_u64(&mut buf, SYNC_STEP2);
                        write_buf(&mut buf, update);
                    }
                    SyncMessage::Update(update) => {
                        write_var_u64(&mut buf, SYNC_UPDATE);
                        write_buf(&mut buf, update);
                    }
                }
            }
            Message::Awareness(payload) => {
                write_var_u64(&mut buf, MSG_AWARENESS);
                write_buf(&mut buf, payload);
            }
            Message::Auth => {
                write_var_u64(&mut buf, MSG_AUTH);
            }
        }
        buf
    }

    /// Deserialize from the wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let msg = match read_var_u64(bytes, &mut pos)? {
            MSG_SYNC => {
                let sub = read_var_u64(bytes, &mut pos)?;
                let payload = read_buf(bytes, &mut pos)?.to_vec();
                match sub {
                    SYNC_STEP1 => Message::Sync(SyncMessage::Step1(payload)),
                    SYNC_STEP2 => Message::Sync(SyncMessage::Step2(payload)),
                    SYNC_UPDATE => Message::Sync(SyncMessage::Update(payload)),
                    other => {
                        return Err(ProtocolError::MalformedFrame(format!(
                            "unknown sync subtype: {other}"
                        )))
                    }
                }
            }
            MSG_AWARENESS => Message::Awareness(read_buf(bytes, &mut pos)?.to_vec()),
            MSG_AUTH => Message::Auth,
            other => return Err(ProtocolError::UnknownType(other)),
        };
        Ok(msg)
    }
}

/// Encode a sync step 1 carrying `doc`'s current state vector.
pub fn encode_sync_step1(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    Message::Sync(SyncMessage::Step1(txn.state_vector().encode_v1())).encode()
}

/// Encode a sync step 2 carrying everything `doc` knows beyond `state_vector`.
pub fn encode_sync_step2(doc: &Doc, state_vector: &StateVector) -> Vec<u8> {
    let txn = doc.transact();
    Message::Sync(SyncMessage::Step2(txn.encode_diff_v1(state_vector))).encode()
}

/// Encode an incremental update frame from raw yrs v1 update bytes.
pub fn encode_sync_update(update: Vec<u8>) -> Vec<u8> {
    Message::Sync(SyncMessage::Update(update)).encode()
}

/// Apply a SYNC submessage to `doc`, tagging the transaction with `origin`
/// so downstream update hooks can suppress the echo back to the sender.
///
/// Returns the reply frame when one is warranted: step 1 always warrants a
/// step 2, the other submessages never produce a reply.
pub fn handle_sync_message(
    doc: &Doc,
    msg: SyncMessage,
    origin: Option<&Origin>,
) -> Result<Option<Vec<u8>>, ProtocolError> {
    match msg {
        SyncMessage::Step1(sv) => {
            let sv = StateVector::decode_v1(&sv).map_err(|e| ProtocolError::Sync(e.to_string()))?;
            Ok(Some(encode_sync_step2(doc, &sv)))
        }
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            let update =
                Update::decode_v1(&update).map_err(|e| ProtocolError::Sync(e.to_string()))?;
            let mut txn = match origin {
                Some(origin) => doc.transact_mut_with(origin.clone()),
                None => doc.transact_mut(),
            };
            txn.apply_update(update)
                .map_err(|e| ProtocolError::Sync(e.to_string()))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text, WriteTxn};

    #[test]
    fn test_varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_var_u64(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_var_u64(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let buf = vec![0x80, 0x80]; // continuation bits with no terminator
        let mut pos = 0;
        assert!(read_var_u64(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_sync_frames_roundtrip() {
        for msg in [
            Message::Sync(SyncMessage::Step1(vec![1, 2, 3])),
            Message::Sync(SyncMessage::Step2(vec![4, 5])),
            Message::Sync(SyncMessage::Update(Vec::new())),
            Message::Awareness(vec![9, 9, 9]),
            Message::Auth,
        ] {
            let encoded = msg.encode();
            assert_eq!(Message::decode(&encoded).unwrap(), msg);
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 42);
        match Message::decode(&buf) {
            Err(ProtocolError::UnknownType(42)) => {}
            other => panic!("expected UnknownType, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, MSG_AWARENESS);
        write_var_u64(&mut buf, 100); // claims 100 bytes, provides none
        assert!(Message::decode(&buf).is_err());
    }

    #[test]
    fn test_step1_produces_step2_reply() {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "hello");
        }

        let empty_sv = StateVector::default().encode_v1();
        let reply = handle_sync_message(&doc, SyncMessage::Step1(empty_sv), None)
            .unwrap()
            .expect("step1 must produce a reply");

        // The reply must carry the full document state.
        let other = Doc::new();
        match Message::decode(&reply).unwrap() {
            Message::Sync(SyncMessage::Step2(update)) => {
                handle_sync_message(&other, SyncMessage::Step2(update), None).unwrap();
            }
            other => panic!("expected step2 reply, got {other:?}"),
        }
        let txn = other.transact();
        let text = txn.get_text("t").unwrap();
        assert_eq!(text.get_string(&txn), "hello");
    }

    #[test]
    fn test_update_application_no_reply() {
        let source = Doc::new();
        let update = {
            let mut txn = source.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "abc");
            drop(txn);
            let txn = source.transact();
            txn.encode_state_as_update_v1(&StateVector::default())
        };

        let target = Doc::new();
        let reply = handle_sync_message(&target, SyncMessage::Update(update), None).unwrap();
        assert!(reply.is_none());

        let txn = target.transact();
        assert_eq!(txn.get_text("t").unwrap().get_string(&txn), "abc");
    }

    #[test]
    fn test_bad_update_is_rejected() {
        let doc = Doc::new();
        let result = handle_sync_message(&doc, SyncMessage::Update(vec![0xff; 8]), None);
        assert!(matches!(result, Err(ProtocolError::Sync(_))));
    }

    #[test]
    fn test_two_peer_handshake_converges() {
        let a = Doc::new();
        let b = Doc::new();
        {
            let mut txn = a.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "from-a");
        }
        {
            let mut txn = b.transact_mut();
            let text = txn.get_or_insert_text("t");
            text.insert(&mut txn, 0, "from-b");
        }

        // a → b: step1; b replies step2; and the mirror image.
        let sv_a = {
            let txn = a.transact();
            txn.state_vector().encode_v1()
        };
        if let Some(reply) = handle_sync_message(&b, SyncMessage::Step1(sv_a), None).unwrap() {
            if let Message::Sync(sync) = Message::decode(&reply).unwrap() {
                handle_sync_message(&a, sync, None).unwrap();
            }
        }
        let sv_b = {
            let txn = b.transact();
            txn.state_vector().encode_v1()
        };
        if let Some(reply) = handle_sync_message(&a, SyncMessage::Step1(sv_b), None).unwrap() {
            if let Message::Sync(sync) = Message::decode(&reply).unwrap() {
                handle_sync_message(&b, sync, None).unwrap();
            }
        }

        let txn_a = a.transact();
        let txn_b = b.transact();
        assert_eq!(
            txn_a.get_text("t").unwrap().get_string(&txn_a),
            txn_b.get_text("t").unwrap().get_string(&txn_b),
        );
    }
}
