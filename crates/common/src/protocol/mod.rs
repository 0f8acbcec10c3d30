// Wire framing for the collaboration channel.
//
// Every frame is `[varUint messageType][payload]`:
//   0 = sync       (sub-tagged step-1 / step-2 / update, each carrying
//                   a length-prefixed byte payload)
//   1 = awareness  (length-prefixed awareness delta, see
//                   `crate::awareness`)
//   2 = signal     (two varstrings: peer user id + opaque payload)
//
// The layout matches the y-websocket framing so browser peers and this
// implementation can share a room.

pub mod codec;

use thiserror::Error;

use codec::{CodecError, Reader, Writer};

const MSG_SYNC: u64 = 0;
const MSG_AWARENESS: u64 = 1;
const MSG_SIGNAL: u64 = 2;

const SYNC_STEP_1: u64 = 0;
const SYNC_STEP_2: u64 = 1;
const SYNC_UPDATE: u64 = 2;

/// Sub-messages of the document sync handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFrame {
    /// State vector announcing what the sender already has.
    Step1(Vec<u8>),
    /// Delta answering a step-1; contains everything the requester was
    /// missing.
    Step2(Vec<u8>),
    /// Incremental delta produced outside the handshake.
    Update(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Sync(SyncFrame),
    /// Encoded awareness delta; forwarded byte-for-byte by the broker.
    Awareness(Vec<u8>),
    /// `peer` is the target user id on the way in and the sender user
    /// id on the way out; `payload` is never interpreted in transit.
    Signal { peer: String, payload: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
    #[error("unknown sync sub-type {0}")]
    UnknownSyncType(u64),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl WireMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            WireMessage::Sync(frame) => {
                writer.write_var_u64(MSG_SYNC);
                let (tag, body) = match frame {
                    SyncFrame::Step1(body) => (SYNC_STEP_1, body),
                    SyncFrame::Step2(body) => (SYNC_STEP_2, body),
                    SyncFrame::Update(body) => (SYNC_UPDATE, body),
                };
                writer.write_var_u64(tag);
                writer.write_var_buf(body);
            }
            WireMessage::Awareness(delta) => {
                writer.write_var_u64(MSG_AWARENESS);
                writer.write_var_buf(delta);
            }
            WireMessage::Signal { peer, payload } => {
                writer.write_var_u64(MSG_SIGNAL);
                writer.write_var_string(peer);
                writer.write_var_string(payload);
            }
        }
        writer.into_vec()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        let mut reader = Reader::new(frame);
        match reader.read_var_u64()? {
            MSG_SYNC => {
                let tag = reader.read_var_u64()?;
                let body = reader.read_var_buf()?.to_vec();
                let frame = match tag {
                    SYNC_STEP_1 => SyncFrame::Step1(body),
                    SYNC_STEP_2 => SyncFrame::Step2(body),
                    SYNC_UPDATE => SyncFrame::Update(body),
                    other => return Err(FrameError::UnknownSyncType(other)),
                };
                Ok(WireMessage::Sync(frame))
            }
            MSG_AWARENESS => Ok(WireMessage::Awareness(reader.read_var_buf()?.to_vec())),
            MSG_SIGNAL => Ok(WireMessage::Signal {
                peer: reader.read_var_string()?,
                payload: reader.read_var_string()?,
            }),
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }
}
