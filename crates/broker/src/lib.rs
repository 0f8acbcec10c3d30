// Room broker: terminates WebSocket connections from editor clients,
// keeps one replicated document per room, fans out sync and awareness
// traffic, relays voice signaling, and snapshots room state to SQLite.

pub mod config;
pub mod registry;
pub mod server;
pub mod store;
