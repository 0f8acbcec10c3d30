// Snapshot persistence for room documents.
//
// Storage is best effort from the broker's point of view: a missing or
// failing store degrades to in-memory-only rooms and is never surfaced
// to connected clients.

mod sqlite;

pub use sqlite::SqliteSnapshotStore;

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use huddle_common::room::RoomName;

/// Upsert-by-room-name storage for full document state encodings.
pub trait SnapshotStore: Send + Sync {
    /// Last saved state for the room, if any.
    fn load(&self, room: &RoomName) -> Result<Option<Vec<u8>>>;
    /// Last-writer-wins upsert.
    fn save(&self, room: &RoomName, state: &[u8]) -> Result<()>;
}

/// In-memory store for tests and ephemeral single-process setups.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self, room: &RoomName) -> Result<Option<Vec<u8>>> {
        let snapshots =
            self.snapshots.lock().map_err(|_| anyhow!("snapshot map lock poisoned"))?;
        Ok(snapshots.get(room.as_str()).cloned())
    }

    fn save(&self, room: &RoomName, state: &[u8]) -> Result<()> {
        let mut snapshots =
            self.snapshots.lock().map_err(|_| anyhow!("snapshot map lock poisoned"))?;
        snapshots.insert(room.as_str().to_string(), state.to_vec());
        Ok(())
    }
}
