// Voice call orchestration over the room's signal channel.
//
// Media capture and peer connections are host capabilities injected
// behind the `MediaEngine` / `MediaSession` traits; this module owns
// only the signaling state machine (offer / answer / ICE / leave) and
// the per-peer call lifecycle. Payloads travel as JSON strings inside
// signal frames, opaque to the broker.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Signal payload relayed peer to peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    VoiceOffer { sdp: String },
    VoiceAnswer { sdp: String },
    VoiceIce { candidate: serde_json::Value },
    VoiceLeave,
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("local audio capture failed: {0}")]
    Capture(String),
    #[error("media session error: {0}")]
    Media(String),
    #[error("signal payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One peer connection supplied by the platform's WebRTC stack.
pub trait MediaSession {
    fn create_offer(&mut self) -> Result<String, VoiceError>;
    /// Apply the remote offer and produce the local answer.
    fn accept_offer(&mut self, sdp: &str) -> Result<String, VoiceError>;
    fn accept_answer(&mut self, sdp: &str) -> Result<(), VoiceError>;
    fn add_remote_candidate(&mut self, candidate: &serde_json::Value) -> Result<(), VoiceError>;
    fn close(&mut self);
}

/// Platform capability for audio capture and connection creation.
pub trait MediaEngine {
    fn capture_local_audio(&mut self) -> Result<(), VoiceError>;
    fn release_local_audio(&mut self);
    /// Enable or disable the captured track; used for mute.
    fn set_audio_enabled(&mut self, enabled: bool);
    /// New connection to `peer_id` carrying the local audio track.
    fn create_connection(&mut self, peer_id: &str) -> Result<Box<dyn MediaSession>, VoiceError>;
    /// Tear down the playback sink for `peer_id`.
    fn detach_remote_audio(&mut self, peer_id: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// We sent an offer and are waiting for the answer.
    Offering,
    /// We answered the peer's offer.
    Answered,
    /// Our offer was answered.
    Connected,
    Closed,
}

struct PeerCall {
    session: Box<dyn MediaSession>,
    phase: PeerPhase,
}

/// A signal to hand to the session for delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundSignal {
    pub to: String,
    pub payload: SignalPayload,
}

impl OutboundSignal {
    pub fn payload_json(&self) -> Result<String, VoiceError> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

pub struct VoiceCall<E: MediaEngine> {
    engine: E,
    peers: HashMap<String, PeerCall>,
    in_call: bool,
    muted: bool,
}

impl<E: MediaEngine> VoiceCall<E> {
    pub fn new(engine: E) -> Self {
        Self { engine, peers: HashMap::new(), in_call: false, muted: false }
    }

    pub fn in_call(&self) -> bool {
        self.in_call
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn phase_of(&self, peer_id: &str) -> Option<PeerPhase> {
        self.peers.get(peer_id).map(|call| call.phase)
    }

    /// Acquire local audio and offer to every currently known peer.
    /// Capture failure rejects the whole join; the caller decides
    /// whether to retry.
    pub fn join_call(&mut self, peer_ids: &[String]) -> Result<Vec<OutboundSignal>, VoiceError> {
        if self.in_call {
            return Ok(Vec::new());
        }
        self.engine.capture_local_audio()?;
        self.in_call = true;
        self.muted = false;

        let mut outbound = Vec::new();
        for peer_id in peer_ids {
            if let Some(signal) = self.offer_to(peer_id)? {
                outbound.push(signal);
            }
        }
        Ok(outbound)
    }

    /// A peer appeared in the room while we are in a call: offer
    /// proactively so they hear us without any user action.
    pub fn peer_joined(&mut self, peer_id: &str) -> Result<Option<OutboundSignal>, VoiceError> {
        if !self.in_call {
            return Ok(None);
        }
        self.offer_to(peer_id)
    }

    /// Open a connection to `peer_id` and produce the offer. Peers with
    /// a live entry are skipped; a closed entry is replaced, which lets
    /// a peer rejoin after leaving.
    fn offer_to(&mut self, peer_id: &str) -> Result<Option<OutboundSignal>, VoiceError> {
        if let Some(call) = self.peers.get(peer_id) {
            if call.phase != PeerPhase::Closed {
                return Ok(None);
            }
        }

        let mut session = self.engine.create_connection(peer_id)?;
        let sdp = session.create_offer()?;
        self.peers.insert(peer_id.to_string(), PeerCall { session, phase: PeerPhase::Offering });
        Ok(Some(OutboundSignal {
            to: peer_id.to_string(),
            payload: SignalPayload::VoiceOffer { sdp },
        }))
    }

    /// A peer vanished (left the call or lost its connection): close
    /// its media session and drop its audio sink. The document session
    /// is untouched.
    pub fn peer_left(&mut self, peer_id: &str) {
        if let Some(call) = self.peers.get_mut(peer_id) {
            if call.phase != PeerPhase::Closed {
                call.session.close();
                call.phase = PeerPhase::Closed;
                self.engine.detach_remote_audio(peer_id);
                debug!(peer = %peer_id, "voice peer closed");
            }
        }
    }

    /// Handle one signal payload relayed from `from`.
    pub fn handle_signal(
        &mut self,
        from: &str,
        raw_payload: &str,
    ) -> Result<Option<OutboundSignal>, VoiceError> {
        match serde_json::from_str::<SignalPayload>(raw_payload)? {
            SignalPayload::VoiceOffer { sdp } => {
                let needs_session = match self.peers.get(from) {
                    None => true,
                    Some(call) => call.phase == PeerPhase::Closed,
                };
                if needs_session {
                    let session = self.engine.create_connection(from)?;
                    self.peers
                        .insert(from.to_string(), PeerCall { session, phase: PeerPhase::Answered });
                }
                let Some(call) = self.peers.get_mut(from) else {
                    return Ok(None);
                };
                let answer = call.session.accept_offer(&sdp)?;
                call.phase = PeerPhase::Answered;
                Ok(Some(OutboundSignal {
                    to: from.to_string(),
                    payload: SignalPayload::VoiceAnswer { sdp: answer },
                }))
            }
            SignalPayload::VoiceAnswer { sdp } => {
                match self.peers.get_mut(from) {
                    Some(call) if call.phase == PeerPhase::Offering => {
                        call.session.accept_answer(&sdp)?;
                        call.phase = PeerPhase::Connected;
                    }
                    // Unsolicited or duplicate answers carry no state
                    // we can apply.
                    _ => debug!(peer = %from, "ignoring answer outside the offering phase"),
                }
                Ok(None)
            }
            SignalPayload::VoiceIce { candidate } => {
                match self.peers.get_mut(from) {
                    Some(call) if call.phase != PeerPhase::Closed => {
                        call.session.add_remote_candidate(&candidate)?;
                    }
                    _ => debug!(peer = %from, "dropping ICE candidate for unknown peer"),
                }
                Ok(None)
            }
            SignalPayload::VoiceLeave => {
                self.peer_left(from);
                Ok(None)
            }
        }
    }

    /// Notify peers, close every connection, release capture, reset.
    pub fn leave_call(&mut self) -> Vec<OutboundSignal> {
        if !self.in_call {
            return Vec::new();
        }

        let mut peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        peer_ids.sort();

        let mut outbound = Vec::new();
        for peer_id in peer_ids {
            outbound
                .push(OutboundSignal { to: peer_id.clone(), payload: SignalPayload::VoiceLeave });
            self.peer_left(&peer_id);
        }
        self.peers.clear();
        self.engine.release_local_audio();
        self.in_call = false;
        self.muted = false;
        outbound
    }

    /// Flip local track enablement. No renegotiation happens; peers
    /// simply receive silence while muted.
    pub fn toggle_mute(&mut self) {
        if !self.in_call {
            return;
        }
        self.muted = !self.muted;
        self.engine.set_audio_enabled(!self.muted);
    }
}
