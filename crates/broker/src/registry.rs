// Room lifecycle: lazy creation with snapshot hydration, debounced
// persistence on mutation, and deferred teardown once the last
// connection is gone.
//
// Timing rules:
// - a mutated document is saved after `persist_debounce` of quiet;
//   every new mutation restarts the timer so a busy room saves at most
//   once per quiet period.
// - an empty room lives for `teardown_grace` before it is dropped from
//   the registry, so a page refresh reattaches to warm state. Teardown
//   cancels any pending debounced save and performs one final save.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use huddle_common::awareness::AwarenessState;
use huddle_common::doc::{DocError, ReplicatedDoc};
use huddle_common::protocol::codec::CodecError;
use huddle_common::room::RoomName;

use crate::store::SnapshotStore;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Quiet period before a mutated document is persisted.
    pub persist_debounce: Duration,
    /// How long an empty room is kept alive to tolerate reconnects.
    pub teardown_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_secs(2),
            teardown_grace: Duration::from_secs(30),
        }
    }
}

/// A connected participant as seen by its room.
#[derive(Debug)]
pub struct Peer {
    /// Stable user identity; signal frames are addressed to this.
    pub user_id: String,
    /// The peer's CRDT client id, used for awareness cleanup.
    pub replica_id: u64,
    /// Outbound frame queue drained by the connection's write loop.
    pub sender: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct Room {
    name: RoomName,
    doc: Mutex<ReplicatedDoc>,
    awareness: Mutex<AwarenessState>,
    peers: Mutex<HashMap<u64, Peer>>,
    store: Option<Arc<dyn SnapshotStore>>,
    config: RegistryConfig,
    persist_timer: Mutex<Option<JoinHandle<()>>>,
    teardown_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    fn new(
        name: RoomName,
        doc: ReplicatedDoc,
        store: Option<Arc<dyn SnapshotStore>>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            name,
            doc: Mutex::new(doc),
            awareness: Mutex::new(AwarenessState::new()),
            peers: Mutex::new(HashMap::new()),
            store,
            config,
            persist_timer: Mutex::new(None),
            teardown_timer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &RoomName {
        &self.name
    }

    /// Encoded state vector for the sync step-1 sent on connect.
    pub async fn state_vector(&self) -> Vec<u8> {
        self.doc.lock().await.state_vector()
    }

    /// Step-2 payload answering a remote step-1.
    pub async fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        self.doc.lock().await.diff_since(remote_state_vector)
    }

    pub async fn text(&self, stream: &str) -> String {
        self.doc.lock().await.text(stream)
    }

    /// Merge a client delta and restart the persistence debounce.
    pub async fn apply_sync_update(self: &Arc<Self>, bytes: &[u8]) -> Result<(), DocError> {
        self.doc.lock().await.apply_update(bytes)?;
        self.schedule_persist().await;
        Ok(())
    }

    pub async fn apply_awareness(&self, delta: &[u8]) -> Result<(), CodecError> {
        self.awareness.lock().await.apply_remote(delta)?;
        Ok(())
    }

    pub async fn awareness_snapshot(&self) -> Option<Vec<u8>> {
        self.awareness.lock().await.snapshot()
    }

    /// Tombstone a departed replica; returns the removal delta to
    /// broadcast, if it had live presence.
    pub async fn remove_awareness(&self, replica_id: u64) -> Option<Vec<u8>> {
        self.awareness.lock().await.remove_clients(&[replica_id])
    }

    pub async fn add_peer(&self, conn_id: u64, peer: Peer) {
        self.cancel_teardown().await;
        self.peers.lock().await.insert(conn_id, peer);
    }

    /// Remove a connection; returns the number of peers left.
    pub async fn remove_peer(&self, conn_id: u64) -> usize {
        let mut peers = self.peers.lock().await;
        peers.remove(&conn_id);
        peers.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Queue `frame` to every connection except the sender. Peers whose
    /// write loop has gone away are skipped; their disconnect path
    /// cleans them up.
    pub async fn broadcast_except(&self, sender_conn: u64, frame: &[u8]) {
        let peers = self.peers.lock().await;
        for (conn_id, peer) in peers.iter() {
            if *conn_id != sender_conn {
                let _ = peer.sender.send(frame.to_vec());
            }
        }
    }

    /// Deliver `frame` to the first connection belonging to
    /// `target_user` other than the sender. Returns false when no such
    /// peer is connected.
    pub async fn send_to_user(&self, sender_conn: u64, target_user: &str, frame: Vec<u8>) -> bool {
        let peers = self.peers.lock().await;
        for (conn_id, peer) in peers.iter() {
            if *conn_id != sender_conn && peer.user_id == target_user {
                return peer.sender.send(frame).is_ok();
            }
        }
        false
    }

    async fn schedule_persist(self: &Arc<Self>) {
        if self.store.is_none() {
            return;
        }
        let room = Arc::clone(self);
        let debounce = self.config.persist_debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            room.persist_now().await;
        });
        if let Some(previous) = self.persist_timer.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn cancel_persist(&self) {
        if let Some(handle) = self.persist_timer.lock().await.take() {
            handle.abort();
        }
    }

    pub(crate) async fn persist_now(&self) {
        let Some(store) = self.store.as_ref() else { return };
        let state = self.doc.lock().await.encode_state();
        match store.save(&self.name, &state) {
            Ok(()) => debug!(room = %self.name, bytes = state.len(), "room snapshot saved"),
            Err(error) => {
                // The room stays usable and the next quiet period will
                // try again.
                warn!(room = %self.name, error = ?error, "room snapshot save failed");
            }
        }
    }

    async fn set_teardown(&self, handle: JoinHandle<()>) {
        if let Some(previous) = self.teardown_timer.lock().await.replace(handle) {
            previous.abort();
        }
    }

    pub(crate) async fn cancel_teardown(&self) {
        if let Some(handle) = self.teardown_timer.lock().await.take() {
            handle.abort();
        }
    }
}

pub struct RoomRegistry {
    rooms: Mutex<HashMap<RoomName, Arc<Room>>>,
    store: Option<Arc<dyn SnapshotStore>>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(store: Option<Arc<dyn SnapshotStore>>, config: RegistryConfig) -> Self {
        Self { rooms: Mutex::new(HashMap::new()), store, config }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.len()
    }

    /// Resolve or create the room. Creation is single-flight: the map
    /// lock is held across hydration, so a concurrent second caller
    /// gets the same instance instead of a racing duplicate.
    pub async fn get_or_create(&self, name: &RoomName) -> Arc<Room> {
        let mut rooms = self.rooms.lock().await;
        if let Some(room) = rooms.get(name) {
            room.cancel_teardown().await;
            return Arc::clone(room);
        }

        let mut doc = ReplicatedDoc::new();
        if let Some(store) = &self.store {
            match store.load(name) {
                Ok(Some(state)) => {
                    if let Err(error) = doc.apply_update(&state) {
                        warn!(room = %name, error = %error, "persisted snapshot is unusable, starting empty");
                    } else {
                        debug!(room = %name, bytes = state.len(), "room hydrated from snapshot");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(room = %name, error = ?error, "snapshot load failed, starting empty");
                }
            }
        }

        let room =
            Arc::new(Room::new(name.clone(), doc, self.store.clone(), self.config.clone()));
        rooms.insert(name.clone(), Arc::clone(&room));
        info!(room = %name, "room created");
        room
    }

    /// Start the teardown grace timer for a room whose last connection
    /// closed. A reconnect within the grace window cancels it.
    pub async fn release(self: &Arc<Self>, name: &RoomName) {
        let room = { self.rooms.lock().await.get(name).cloned() };
        let Some(room) = room else { return };
        if room.peer_count().await > 0 {
            return;
        }

        let registry = Arc::clone(self);
        let name = name.clone();
        let grace = self.config.teardown_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.teardown_if_empty(&name).await;
        });
        room.set_teardown(handle).await;
    }

    async fn teardown_if_empty(&self, name: &RoomName) {
        let mut rooms = self.rooms.lock().await;
        let Some(room) = rooms.get(name).cloned() else { return };
        // A connection may have raced the timer; keep the room.
        if room.peer_count().await > 0 {
            return;
        }

        // Flush while the entry is still registered, with the map lock
        // held, so a reconnect cannot slip in between the removal and
        // the final save and hydrate from a stale snapshot.
        room.cancel_persist().await;
        room.persist_now().await;
        rooms.remove(name);
        info!(room = %name, "empty room torn down");
    }

    /// Flush every room to storage; used on shutdown.
    pub async fn persist_all(&self) {
        let rooms: Vec<Arc<Room>> = { self.rooms.lock().await.values().cloned().collect() };
        for room in rooms {
            room.cancel_persist().await;
            room.persist_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;

    use super::*;
    use crate::store::MemorySnapshotStore;

    /// Store wrapper that counts saves and can be told to fail.
    #[derive(Default)]
    struct CountingStore {
        inner: MemorySnapshotStore,
        saves: AtomicUsize,
        fail_saves: std::sync::atomic::AtomicBool,
    }

    impl CountingStore {
        fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    impl SnapshotStore for CountingStore {
        fn load(&self, room: &RoomName) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.load(room)
        }

        fn save(&self, room: &RoomName, state: &[u8]) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(anyhow!("injected save failure"));
            }
            self.inner.save(room, state)
        }
    }

    /// Store that notes, for every save, whether the room had already
    /// been dropped from the registry map. The map lock being held at
    /// save time counts as still registered.
    #[derive(Default)]
    struct TeardownOrderStore {
        inner: MemorySnapshotStore,
        registry: std::sync::Mutex<Option<Arc<RoomRegistry>>>,
        saves_after_removal: AtomicUsize,
    }

    impl SnapshotStore for TeardownOrderStore {
        fn load(&self, room: &RoomName) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.load(room)
        }

        fn save(&self, room: &RoomName, state: &[u8]) -> anyhow::Result<()> {
            let registry = self.registry.lock().expect("registry slot should be usable");
            if let Some(registry) = registry.as_ref() {
                if let Ok(rooms) = registry.rooms.try_lock() {
                    if !rooms.contains_key(room) {
                        self.saves_after_removal.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            self.inner.save(room, state)
        }
    }

    fn room_name(name: &str) -> RoomName {
        RoomName::parse(name).expect("test room name should parse")
    }

    fn sample_delta(text: &str) -> Vec<u8> {
        ReplicatedDoc::with_client_id(99).insert("file:main", 0, text)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn registry_with(
        store: Arc<CountingStore>,
        config: RegistryConfig,
    ) -> Arc<RoomRegistry> {
        Arc::new(RoomRegistry::new(Some(store), config))
    }

    #[tokio::test(start_paused = true)]
    async fn updates_within_the_quiet_period_coalesce_into_one_save() {
        let store = Arc::new(CountingStore::default());
        let registry = registry_with(Arc::clone(&store), RegistryConfig::default());
        let room = registry.get_or_create(&room_name("DEBOUNCE")).await;

        room.apply_sync_update(&sample_delta("one")).await.expect("update should apply");
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(store.save_count(), 0);

        // The second update restarts the two second timer.
        room.apply_sync_update(&sample_delta("two")).await.expect("update should apply");
        settle().await;
        tokio::time::advance(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(store.save_count(), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_within_grace_reuses_the_warm_room() {
        let store = Arc::new(CountingStore::default());
        let registry = registry_with(store, RegistryConfig::default());
        let name = room_name("WARMROOM");

        let room = registry.get_or_create(&name).await;
        room.apply_sync_update(&sample_delta("kept")).await.expect("update should apply");

        registry.release(&name).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        let again = registry.get_or_create(&name).await;
        assert!(Arc::ptr_eq(&room, &again));
        assert_eq!(again.text("file:main").await, "kept");

        // The cancelled grace timer must not fire later.
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_pending_debounce_and_saves_once() {
        let store = Arc::new(CountingStore::default());
        // Debounce longer than the grace window, so the pending save
        // can only come from the teardown path.
        let config = RegistryConfig {
            persist_debounce: Duration::from_secs(60),
            teardown_grace: Duration::from_secs(5),
        };
        let registry = registry_with(Arc::clone(&store), config);
        let name = room_name("FINALSAV");

        let room = registry.get_or_create(&name).await;
        room.apply_sync_update(&sample_delta("flushed")).await.expect("update should apply");
        drop(room);

        registry.release(&name).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(registry.room_count().await, 0);
        assert_eq!(store.save_count(), 1);

        // The aborted debounce timer stays dead.
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn torn_down_room_rehydrates_from_its_snapshot() {
        let store = Arc::new(CountingStore::default());
        let config = RegistryConfig {
            persist_debounce: Duration::from_secs(2),
            teardown_grace: Duration::from_secs(5),
        };
        let registry = registry_with(Arc::clone(&store), config);
        let name = room_name("HYDRATE1");

        let room = registry.get_or_create(&name).await;
        room.apply_sync_update(&sample_delta("durable")).await.expect("update should apply");
        drop(room);

        registry.release(&name).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(registry.room_count().await, 0);

        let revived = registry.get_or_create(&name).await;
        assert_eq!(revived.text("file:main").await, "durable");
    }

    #[tokio::test(start_paused = true)]
    async fn save_failure_does_not_break_the_next_cycle() {
        let store = Arc::new(CountingStore::default());
        let registry = registry_with(Arc::clone(&store), RegistryConfig::default());
        let room = registry.get_or_create(&room_name("FAILSAVE")).await;

        store.fail_saves.store(true, Ordering::SeqCst);
        room.apply_sync_update(&sample_delta("a")).await.expect("update should apply");
        settle().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(store.save_count(), 1);

        store.fail_saves.store(false, Ordering::SeqCst);
        room.apply_sync_update(&sample_delta("b")).await.expect("update should apply");
        settle().await;
        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(store.save_count(), 2);
        assert!(store.inner.load(room.name()).expect("load should succeed").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn new_connection_cancels_a_scheduled_teardown() {
        let store = Arc::new(CountingStore::default());
        let registry = registry_with(store, RegistryConfig::default());
        let name = room_name("REPOPULA");

        let room = registry.get_or_create(&name).await;
        registry.release(&name).await;
        settle().await;

        // A connection arrives through the registry before the grace
        // window ends.
        let (tx, _rx) = mpsc::unbounded_channel();
        let again = registry.get_or_create(&name).await;
        again
            .add_peer(1, Peer { user_id: "u".to_string(), replica_id: 1, sender: tx })
            .await;
        drop(room);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn final_save_lands_before_the_room_leaves_the_registry() {
        let store = Arc::new(TeardownOrderStore::default());
        let config = RegistryConfig {
            persist_debounce: Duration::from_secs(60),
            teardown_grace: Duration::from_secs(5),
        };
        let registry =
            Arc::new(RoomRegistry::new(Some(Arc::clone(&store) as _), config));
        *store.registry.lock().expect("registry slot should be usable") =
            Some(Arc::clone(&registry));
        let name = room_name("FLUSHORD");

        let room = registry.get_or_create(&name).await;
        room.apply_sync_update(&sample_delta("durable")).await.expect("update should apply");
        drop(room);

        registry.release(&name).await;
        settle().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(registry.room_count().await, 0);
        assert_eq!(
            store.saves_after_removal.load(Ordering::SeqCst),
            0,
            "the final save must run while the room is still registered"
        );

        // A reconnect after teardown hydrates the flushed state.
        let revived = registry.get_or_create(&name).await;
        assert_eq!(revived.text("file:main").await, "durable");
    }

    #[tokio::test]
    async fn malformed_update_is_rejected_and_room_survives() {
        let registry = Arc::new(RoomRegistry::new(None, RegistryConfig::default()));
        let room = registry.get_or_create(&room_name("BADBYTES")).await;

        assert!(room.apply_sync_update(&[0xde, 0xad, 0xbe, 0xef]).await.is_err());
        room.apply_sync_update(&sample_delta("fine")).await.expect("valid update should apply");
        assert_eq!(room.text("file:main").await, "fine");
    }
}
