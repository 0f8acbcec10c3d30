// Ephemeral presence tracking with per-client monotonic clocks.
//
// Each replica publishes a JSON state blob under its numeric client id
// and bumps a clock on every change. A remote entry is accepted only
// when its clock is newer than what we have stored, so reordered
// deliveries cannot resurrect old cursor positions. Removal is a
// tombstone (a `null` state with a bumped clock) rather than a map
// delete, which keeps the stale check working for departed peers.
//
// The encoded form is `varUint(count)` followed by, per entry,
// `varUint(clientId) varUint(clock) varString(stateJson)`, matching
// the y-protocols awareness update layout.

use std::collections::HashMap;

use crate::protocol::codec::{CodecError, Reader, Writer};

const NULL_STATE: &str = "null";

/// One entry of an awareness delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    /// JSON presence state; `None` is a removal tombstone.
    pub state: Option<String>,
}

pub fn encode_update(entries: &[AwarenessEntry]) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.write_var_u64(entries.len() as u64);
    for entry in entries {
        writer.write_var_u64(entry.client_id);
        writer.write_var_u64(entry.clock);
        writer.write_var_string(entry.state.as_deref().unwrap_or(NULL_STATE));
    }
    writer.into_vec()
}

pub fn decode_update(bytes: &[u8]) -> Result<Vec<AwarenessEntry>, CodecError> {
    let mut reader = Reader::new(bytes);
    let count = reader.read_var_u64()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let client_id = reader.read_var_u64()?;
        let clock = reader.read_var_u64()?;
        let state = reader.read_var_string()?;
        let state = if state == NULL_STATE { None } else { Some(state) };
        entries.push(AwarenessEntry { client_id, clock, state });
    }
    Ok(entries)
}

#[derive(Debug, Clone)]
struct Slot {
    clock: u64,
    state: Option<String>,
}

/// Per-room (or per-session) awareness map.
#[derive(Debug, Default)]
pub struct AwarenessState {
    slots: HashMap<u64, Slot>,
}

impl AwarenessState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `state_json` for the local replica with a bumped clock and
    /// return the single-entry delta to broadcast.
    pub fn apply_local(&mut self, client_id: u64, state_json: String) -> Vec<u8> {
        let slot = self.slots.entry(client_id).or_insert(Slot { clock: 0, state: None });
        slot.clock += 1;
        slot.state = Some(state_json.clone());
        encode_update(&[AwarenessEntry { client_id, clock: slot.clock, state: Some(state_json) }])
    }

    /// Merge a remote delta, returning the entries that were accepted.
    /// Entries with a clock at or below the stored one are stale and
    /// dropped without error.
    pub fn apply_remote(&mut self, delta: &[u8]) -> Result<Vec<AwarenessEntry>, CodecError> {
        let mut accepted = Vec::new();
        for entry in decode_update(delta)? {
            match self.slots.get_mut(&entry.client_id) {
                Some(slot) if entry.clock <= slot.clock => continue,
                Some(slot) => {
                    slot.clock = entry.clock;
                    slot.state = entry.state.clone();
                }
                None => {
                    self.slots.insert(
                        entry.client_id,
                        Slot { clock: entry.clock, state: entry.state.clone() },
                    );
                }
            }
            accepted.push(entry);
        }
        Ok(accepted)
    }

    /// Tombstone the given clients, returning the removal delta to
    /// broadcast, or `None` when none of them had live state.
    pub fn remove_clients(&mut self, client_ids: &[u64]) -> Option<Vec<u8>> {
        let mut removed = Vec::new();
        for &client_id in client_ids {
            if let Some(slot) = self.slots.get_mut(&client_id) {
                if slot.state.is_some() {
                    slot.clock += 1;
                    slot.state = None;
                    removed.push(AwarenessEntry { client_id, clock: slot.clock, state: None });
                }
            }
        }
        if removed.is_empty() {
            None
        } else {
            Some(encode_update(&removed))
        }
    }

    /// Full snapshot of live entries for a late joiner; `None` when the
    /// room has no live presence.
    pub fn snapshot(&self) -> Option<Vec<u8>> {
        let mut live: Vec<AwarenessEntry> = self
            .slots
            .iter()
            .filter_map(|(client_id, slot)| {
                slot.state.clone().map(|state| AwarenessEntry {
                    client_id: *client_id,
                    clock: slot.clock,
                    state: Some(state),
                })
            })
            .collect();
        if live.is_empty() {
            return None;
        }
        live.sort_by_key(|entry| entry.client_id);
        Some(encode_update(&live))
    }

    /// Live (non-tombstoned) entries, ordered by client id.
    pub fn live(&self) -> Vec<(u64, &str)> {
        let mut entries: Vec<(u64, &str)> = self
            .slots
            .iter()
            .filter_map(|(client_id, slot)| slot.state.as_deref().map(|s| (*client_id, s)))
            .collect();
        entries.sort_by_key(|(client_id, _)| *client_id);
        entries
    }

    pub fn clock_of(&self, client_id: u64) -> Option<u64> {
        self.slots.get(&client_id).map(|slot| slot.clock)
    }

    pub fn live_len(&self) -> usize {
        self.slots.values().filter(|slot| slot.state.is_some()).count()
    }
}
