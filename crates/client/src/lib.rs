// Client side of a huddle room: a sans-I/O session state machine, an
// editor buffer binding on top of it, a voice signaling orchestrator,
// and a tokio WebSocket transport to carry the frames.

pub mod binding;
pub mod session;
pub mod transport;
pub mod voice;
