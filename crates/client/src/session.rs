// Client session state machine.
//
// Sans-I/O: methods return the frames to write to the transport, and
// `handle_frame` turns an incoming frame into replies plus events for
// the host to act on. The document and awareness replicas live here;
// the editor binding and the voice orchestrator both sit on top.

use thiserror::Error;

use huddle_common::awareness::AwarenessState;
use huddle_common::doc::{stream_name, DocError, ReplicatedDoc};
use huddle_common::presence::{CursorPosition, PresenceState, PresenceUser};
use huddle_common::protocol::codec::CodecError;
use huddle_common::protocol::{FrameError, SyncFrame, WireMessage};

/// Fallback cursor palette; a user id hashes to a stable color.
const USER_COLORS: &[&str] = &[
    "#F87171", "#60A5FA", "#34D399", "#A78BFA", "#FBBF24", "#F472B6", "#38BDF8", "#4ADE80",
];

pub fn color_for_user(user_id: &str) -> &'static str {
    let mut hash: u32 = 0;
    for byte in user_id.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
    }
    USER_COLORS[hash as usize % USER_COLORS.len()]
}

/// Another participant, as assembled from live awareness entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A remote delta changed the document; bound buffers should
    /// refresh.
    DocChanged,
    /// The live peer list changed (join, leave, or cursor move).
    PeersChanged(Vec<Peer>),
    /// A relayed signal addressed to us; `from` is the sender user id.
    Signal { from: String, payload: String },
}

#[derive(Debug, Default)]
pub struct SessionOutput {
    /// Frames to write back to the transport immediately.
    pub replies: Vec<Vec<u8>>,
    pub events: Vec<SessionEvent>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Doc(#[from] DocError),
    #[error("awareness delta could not be decoded: {0}")]
    Awareness(#[from] CodecError),
    #[error("presence state could not be serialized: {0}")]
    Presence(#[from] serde_json::Error),
}

pub struct ClientSession {
    doc: ReplicatedDoc,
    awareness: AwarenessState,
    user: PresenceUser,
    cursor: Option<CursorPosition>,
    peers: Vec<Peer>,
}

impl ClientSession {
    pub fn new(user_id: &str, user_name: &str) -> Self {
        Self {
            doc: ReplicatedDoc::new(),
            awareness: AwarenessState::new(),
            user: PresenceUser {
                id: user_id.to_string(),
                name: user_name.to_string(),
                color: color_for_user(user_id).to_string(),
            },
            peers: Vec::new(),
            cursor: None,
        }
    }

    /// The CRDT client id; passed to the broker as `clientId` so it can
    /// clean up our awareness entry if the connection dies.
    pub fn replica_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn user(&self) -> &PresenceUser {
        &self.user
    }

    pub fn doc(&self) -> &ReplicatedDoc {
        &self.doc
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Frames to send right after the transport opens: our state vector
    /// and our initial presence.
    pub fn hello_frames(&mut self) -> Result<Vec<Vec<u8>>, SessionError> {
        Ok(vec![
            WireMessage::Sync(SyncFrame::Step1(self.doc.state_vector())).encode(),
            self.presence_frame()?,
        ])
    }

    /// Publish a cursor move; returns the awareness frame to send.
    pub fn set_cursor(&mut self, line: u32, column: u32) -> Result<Vec<u8>, SessionError> {
        self.cursor = Some(CursorPosition { line, column });
        self.presence_frame()
    }

    fn presence_frame(&mut self) -> Result<Vec<u8>, SessionError> {
        let state = PresenceState { user: self.user.clone(), cursor: self.cursor };
        let delta = self.awareness.apply_local(self.doc.client_id(), state.to_json()?);
        Ok(WireMessage::Awareness(delta).encode())
    }

    pub fn insert(&mut self, file_id: &str, index: u32, chunk: &str) -> Vec<u8> {
        let delta = self.doc.insert(&stream_name(file_id), index, chunk);
        WireMessage::Sync(SyncFrame::Update(delta)).encode()
    }

    pub fn delete(&mut self, file_id: &str, index: u32, len: u32) -> Vec<u8> {
        let delta = self.doc.delete(&stream_name(file_id), index, len);
        WireMessage::Sync(SyncFrame::Update(delta)).encode()
    }

    /// Delete-then-insert as one update frame.
    pub fn splice(&mut self, file_id: &str, index: u32, removed: u32, inserted: &str) -> Vec<u8> {
        let delta = self.doc.splice(&stream_name(file_id), index, removed, inserted);
        WireMessage::Sync(SyncFrame::Update(delta)).encode()
    }

    pub fn file_text(&self, file_id: &str) -> String {
        self.doc.text(&stream_name(file_id))
    }

    /// Address an opaque signal payload to another user.
    pub fn signal_frame(&self, to_user: &str, payload: &str) -> Vec<u8> {
        WireMessage::Signal { peer: to_user.to_string(), payload: payload.to_string() }.encode()
    }

    /// Feed one frame from the transport through the state machine.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Result<SessionOutput, SessionError> {
        let mut output = SessionOutput::default();
        match WireMessage::decode(frame)? {
            WireMessage::Sync(SyncFrame::Step1(state_vector)) => {
                let diff = self.doc.diff_since(&state_vector)?;
                output.replies.push(WireMessage::Sync(SyncFrame::Step2(diff)).encode());
            }
            WireMessage::Sync(SyncFrame::Step2(update))
            | WireMessage::Sync(SyncFrame::Update(update)) => {
                self.doc.apply_update(&update)?;
                output.events.push(SessionEvent::DocChanged);
            }
            WireMessage::Awareness(delta) => {
                let accepted = self.awareness.apply_remote(&delta)?;
                if !accepted.is_empty() {
                    let peers = self.rebuild_peers();
                    if peers != self.peers {
                        self.peers = peers.clone();
                        output.events.push(SessionEvent::PeersChanged(peers));
                    }
                }
            }
            WireMessage::Signal { peer, payload } => {
                output.events.push(SessionEvent::Signal { from: peer, payload });
            }
        }
        Ok(output)
    }

    fn rebuild_peers(&self) -> Vec<Peer> {
        let own_replica = self.doc.client_id();
        let mut peers: Vec<Peer> = self
            .awareness
            .live()
            .into_iter()
            .filter(|(replica_id, _)| *replica_id != own_replica)
            .filter_map(|(_, state)| PresenceState::from_json(state))
            .map(|state| Peer {
                user_id: state.user.id,
                name: state.user.name,
                color: state.user.color,
                cursor: state.cursor,
            })
            .collect();
        peers.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        peers
    }
}
