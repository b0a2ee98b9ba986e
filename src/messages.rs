//! # Wire Protocol Messages
//!
//! Serializable types exchanged between routers and the framing used to put
//! them on a stream.
//!
//! ## Envelope
//!
//! Every frame carries one [`Rpc`]: any combination of subscription changes,
//! published messages and a control block. Control rides along with data
//! whenever a data frame is already going to the peer.
//!
//! | Field | Contents |
//! |-------|----------|
//! | `subscriptions` | `SubOpts { topic, subscribe }` |
//! | `messages` | full [`Message`] values |
//! | `control` | GRAFT / PRUNE / IHAVE / IWANT / IDONTWANT |
//!
//! ## Framing
//!
//! `len (u32, big-endian) || bincode(Rpc)`. Frames above the configured
//! maximum are refused before the body is read.
//!
//! ## Message IDs
//!
//! A 32-byte [`MessageId`] derived with blake3:
//! - `StrictSign`: `blake3(domain || from || seqno)`
//! - `StrictNoSign`: `blake3(domain || data)`

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{build_signed_payload, MESSAGE_ID_DOMAIN};
use crate::identity::Identity;

/// 32-byte message identifier (blake3 digest).
pub type MessageId = [u8; 32];

/// Default upper bound on a single frame.
/// SECURITY: Bounds the allocation made for a frame body before it is parsed.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024 + 64 * 1024;

/// Length of the frame header.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stream i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("bincode failure: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options(limit: usize) -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(limit as u64)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8], limit: usize) -> Result<T, bincode::Error> {
    bincode_options(limit).deserialize(bytes)
}

// ============================================================================
// Signature Policy
// ============================================================================

/// How authorship fields are handled on publish and on receipt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SignaturePolicy {
    /// `from`, `seqno` and `signature` are required and verified.
    #[default]
    StrictSign,
    /// `from`, `seqno` and `signature` must be absent. Ids come from content.
    StrictNoSign,
}

// ============================================================================
// Envelope Types
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubOpts {
    pub topic: String,
    pub subscribe: bool,
}

/// A published message as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub from: Option<Identity>,
    pub seqno: Option<u64>,
    pub topic: String,
    pub data: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

impl Message {
    /// Bytes covered by the signature, when the authorship fields are present.
    pub fn signed_payload(&self) -> Option<Vec<u8>> {
        let from = self.from.as_ref()?;
        let seqno = self.seqno?;
        Some(build_signed_payload(from, seqno, &self.topic, &self.data))
    }
}

/// Derive the dedup key for a message under the given policy.
pub fn message_id(message: &Message, policy: SignaturePolicy) -> MessageId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(MESSAGE_ID_DOMAIN);
    match (policy, message.from, message.seqno) {
        (SignaturePolicy::StrictSign, Some(from), Some(seqno)) => {
            hasher.update(from.as_bytes());
            hasher.update(&seqno.to_be_bytes());
        }
        _ => {
            hasher.update(&message.data);
        }
    }
    *hasher.finalize().as_bytes()
}

/// Peer exchange record offered in a PRUNE.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer: Identity,
    /// Opaque signed address record, if the pruning side has one.
    pub signed_record: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIHave {
    pub topic: String,
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIWant {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlGraft {
    pub topic: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPrune {
    pub topic: String,
    pub peers: Vec<PeerRecord>,
    pub backoff_secs: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlIDontWant {
    pub message_ids: Vec<MessageId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub ihave: Vec<ControlIHave>,
    pub iwant: Vec<ControlIWant>,
    pub graft: Vec<ControlGraft>,
    pub prune: Vec<ControlPrune>,
    pub idontwant: Vec<ControlIDontWant>,
}

impl ControlMessage {
    pub fn is_empty(&self) -> bool {
        self.ihave.is_empty()
            && self.iwant.is_empty()
            && self.graft.is_empty()
            && self.prune.is_empty()
            && self.idontwant.is_empty()
    }

    /// Append every entry of `other`.
    pub fn extend(&mut self, other: ControlMessage) {
        self.ihave.extend(other.ihave);
        self.iwant.extend(other.iwant);
        self.graft.extend(other.graft);
        self.prune.extend(other.prune);
        self.idontwant.extend(other.idontwant);
    }
}

/// One frame worth of protocol traffic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rpc {
    pub subscriptions: Vec<SubOpts>,
    pub messages: Vec<Message>,
    pub control: Option<ControlMessage>,
}

impl Rpc {
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
            && self.messages.is_empty()
            && self.control.as_ref().map_or(true, ControlMessage::is_empty)
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages, ..Default::default() }
    }

    pub fn with_control(control: ControlMessage) -> Self {
        Self { control: Some(control), ..Default::default() }
    }

    pub fn with_subscriptions(subscriptions: Vec<SubOpts>) -> Self {
        Self { subscriptions, ..Default::default() }
    }
}

// ============================================================================
// Framing
// ============================================================================

pub fn encode_rpc(rpc: &Rpc, max_frame_size: usize) -> Result<Vec<u8>, CodecError> {
    let body = bincode_options(max_frame_size).serialize(rpc)?;
    if body.len() > max_frame_size {
        return Err(CodecError::FrameTooLarge { size: body.len(), max: max_frame_size });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode_rpc(body: &[u8], max_frame_size: usize) -> Result<Rpc, CodecError> {
    Ok(deserialize_bounded(body, max_frame_size)?)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, rpc: &Rpc, max_frame_size: usize) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_rpc(rpc, max_frame_size)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the stream ends on a frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Rpc>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(CodecError::FrameTooLarge { size: len, max: max_frame_size });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_rpc(&body, max_frame_size).map(Some)
}
