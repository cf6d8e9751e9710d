//! Ephemeral presence registry ("awareness").
//!
//! Tracks per-connection presence state — user label, heartbeat, cursor —
//! keyed by the CRDT client id. States are versioned by a per-client clock
//! so late or replayed updates never clobber fresher ones, and a removal is
//! a clock-bumped null state so every replica converges on the departure.
//!
//! Nothing here is persisted; the registry dies with its coordinator or
//! session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::{read_string, read_var_u64, write_string, write_var_u64, ProtocolError};

/// CRDT engine client identifier.
pub type ClientId = u64;

/// JSON text used on the wire for a removed state.
const NULL_STATE: &str = "null";

/// One client's slice of an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// JSON-encoded state; `None` announces removal.
    pub state: Option<String>,
}

/// A batch of awareness entries as carried in an AWARENESS frame payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    /// Serialize: varint entry count, then per entry varint client id,
    /// varint clock, var-string state (`"null"` for removals).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 * self.entries.len() + 4);
        write_var_u64(&mut buf, self.entries.len() as u64);
        for entry in &self.entries {
            write_var_u64(&mut buf, entry.client_id);
            write_var_u64(&mut buf, entry.clock);
            write_string(&mut buf, entry.state.as_deref().unwrap_or(NULL_STATE));
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut pos = 0;
        let count = read_var_u64(bytes, &mut pos)?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let client_id = read_var_u64(bytes, &mut pos)?;
            let clock = read_var_u64(bytes, &mut pos)?;
            let state = read_string(bytes, &mut pos)?;
            let state = if state == NULL_STATE { None } else { Some(state) };
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Change set produced by applying an update to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessEvent {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

struct ClientEntry {
    clock: u64,
    /// `None` is a removal tombstone; the clock keeps late updates out.
    state: Option<String>,
    last_updated: Instant,
}

/// The awareness registry: `client_id → (clock, state, last update time)`.
pub struct Awareness {
    local_id: ClientId,
    clients: HashMap<ClientId, ClientEntry>,
}

impl Awareness {
    pub fn new(local_id: ClientId) -> Self {
        Self {
            local_id,
            clients: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> ClientId {
        self.local_id
    }

    /// Number of clients with a present (non-tombstone) state.
    pub fn len(&self) -> usize {
        self.clients.values().filter(|e| e.state.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The local client's JSON state, if one was announced.
    pub fn local_state(&self) -> Option<&str> {
        self.clients
            .get(&self.local_id)
            .and_then(|e| e.state.as_deref())
    }

    /// Present states for every client.
    pub fn states(&self) -> impl Iterator<Item = (ClientId, &str)> {
        self.clients
            .iter()
            .filter_map(|(id, e)| e.state.as_deref().map(|s| (*id, s)))
    }

    /// Apply a remote update. Entries with stale clocks are ignored; a null
    /// state with a fresh clock removes the client.
    pub fn apply_update(&mut self, update: AwarenessUpdate) -> AwarenessEvent {
        let now = Instant::now();
        let mut event = AwarenessEvent::default();
        for entry in update.entries {
            match self.clients.get_mut(&entry.client_id) {
                Some(existing) => {
                    let fresher = entry.clock > existing.clock
                        || (entry.clock == existing.clock
                            && entry.state.is_none()
                            && existing.state.is_some());
                    if !fresher {
                        continue;
                    }
                    let was_present = existing.state.is_some();
                    existing.clock = entry.clock;
                    existing.last_updated = now;
                    match (was_present, entry.state) {
                        (true, Some(state)) => {
                            existing.state = Some(state);
                            event.updated.push(entry.client_id);
                        }
                        (true, None) => {
                            existing.state = None;
                            event.removed.push(entry.client_id);
                        }
                        (false, Some(state)) => {
                            existing.state = Some(state);
                            event.added.push(entry.client_id);
                        }
                        (false, None) => {
                            // Tombstone refreshed; nothing observable changed.
                        }
                    }
                }
                None => {
                    let present = entry.state.is_some();
                    self.clients.insert(
                        entry.client_id,
                        ClientEntry {
                            clock: entry.clock,
                            state: entry.state,
                            last_updated: now,
                        },
                    );
                    if present {
                        event.added.push(entry.client_id);
                    }
                }
            }
        }
        event
    }

    /// Replace the local state, bumping the clock. Returns the single-entry
    /// update to broadcast.
    pub fn set_local_state(&mut self, state: impl Into<String>) -> AwarenessUpdate {
        let state = state.into();
        let now = Instant::now();
        let entry = self
            .clients
            .entry(self.local_id)
            .or_insert_with(|| ClientEntry {
                clock: 0,
                state: None,
                last_updated: now,
            });
        entry.clock += 1;
        entry.state = Some(state.clone());
        entry.last_updated = now;
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: self.local_id,
                clock: entry.clock,
                state: Some(state),
            }],
        }
    }

    /// Remove the given clients (clock-bumped null states). Returns the
    /// update to broadcast, or `None` when nothing was present.
    pub fn remove_clients(&mut self, ids: &[ClientId]) -> Option<AwarenessUpdate> {
        let now = Instant::now();
        let mut entries = Vec::new();
        for id in ids {
            if let Some(entry) = self.clients.get_mut(id) {
                if entry.state.is_some() {
                    entry.clock += 1;
                    entry.state = None;
                    entry.last_updated = now;
                    entries.push(AwarenessEntry {
                        client_id: *id,
                        clock: entry.clock,
                        state: None,
                    });
                }
            }
        }
        if entries.is_empty() {
            None
        } else {
            Some(AwarenessUpdate { entries })
        }
    }

    /// Full update carrying every present state; what a joining socket
    /// receives right after sync step 1.
    pub fn full_update(&self) -> AwarenessUpdate {
        let entries = self
            .clients
            .iter()
            .filter_map(|(id, e)| {
                e.state.as_ref().map(|state| AwarenessEntry {
                    client_id: *id,
                    clock: e.clock,
                    state: Some(state.clone()),
                })
            })
            .collect();
        AwarenessUpdate { entries }
    }

    /// Clients with a present state updated within `ttl`. The local client
    /// is always included when present, regardless of its age.
    pub fn active_clients(&self, ttl: Duration) -> Vec<ClientId> {
        let now = Instant::now();
        let mut active: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(id, e)| {
                e.state.is_some()
                    && (**id == self.local_id || now.duration_since(e.last_updated) <= ttl)
            })
            .map(|(id, _)| *id)
            .collect();
        active.sort_unstable();
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(client_id: ClientId, clock: u64, state: Option<&str>) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id,
                clock,
                state: state.map(str::to_owned),
            }],
        }
    }

    #[test]
    fn test_update_encode_roundtrip() {
        let upd = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    client_id: 7,
                    clock: 3,
                    state: Some(r#"{"user":{"name":"a"},"hb":1}"#.into()),
                },
                AwarenessEntry {
                    client_id: 9,
                    clock: 1,
                    state: None,
                },
            ],
        };
        let decoded = AwarenessUpdate::decode(&upd.encode()).unwrap();
        assert_eq!(decoded, upd);
    }

    #[test]
    fn test_add_update_remove_events() {
        let mut reg = Awareness::new(1);

        let ev = reg.apply_update(update(2, 1, Some("{}")));
        assert_eq!(ev.added, vec![2]);

        let ev = reg.apply_update(update(2, 2, Some(r#"{"hb":5}"#)));
        assert_eq!(ev.updated, vec![2]);

        let ev = reg.apply_update(update(2, 3, None));
        assert_eq!(ev.removed, vec![2]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut reg = Awareness::new(1);
        reg.apply_update(update(2, 5, Some("new")));
        let ev = reg.apply_update(update(2, 3, Some("old")));
        assert!(ev.is_empty());
        assert_eq!(reg.states().next(), Some((2, "new")));
    }

    #[test]
    fn test_equal_clock_null_wins() {
        let mut reg = Awareness::new(1);
        reg.apply_update(update(2, 5, Some("s")));
        let ev = reg.apply_update(update(2, 5, None));
        assert_eq!(ev.removed, vec![2]);
    }

    #[test]
    fn test_removal_of_unknown_client_is_silent() {
        let mut reg = Awareness::new(1);
        let ev = reg.apply_update(update(9, 4, None));
        assert!(ev.is_empty());
        // The tombstone clock still guards against the late state.
        let ev = reg.apply_update(update(9, 3, Some("late")));
        assert!(ev.is_empty());
    }

    #[test]
    fn test_set_local_state_bumps_clock() {
        let mut reg = Awareness::new(1);
        let first = reg.set_local_state("{}");
        let second = reg.set_local_state(r#"{"hb":2}"#);
        assert_eq!(first.entries[0].clock, 1);
        assert_eq!(second.entries[0].clock, 2);
        assert_eq!(reg.local_state(), Some(r#"{"hb":2}"#));
    }

    #[test]
    fn test_remove_clients_broadcasts_nulls() {
        let mut reg = Awareness::new(1);
        reg.apply_update(update(2, 1, Some("a")));
        reg.apply_update(update(3, 1, Some("b")));

        let upd = reg.remove_clients(&[2, 3, 99]).unwrap();
        assert_eq!(upd.entries.len(), 2);
        assert!(upd.entries.iter().all(|e| e.state.is_none()));
        assert!(reg.is_empty());

        // Removing already-gone clients produces nothing.
        assert!(reg.remove_clients(&[2]).is_none());
    }

    #[test]
    fn test_full_update_excludes_tombstones() {
        let mut reg = Awareness::new(1);
        reg.apply_update(update(2, 1, Some("a")));
        reg.apply_update(update(3, 1, Some("b")));
        reg.remove_clients(&[3]);

        let full = reg.full_update();
        assert_eq!(full.entries.len(), 1);
        assert_eq!(full.entries[0].client_id, 2);
    }

    #[test]
    fn test_active_clients_includes_self() {
        let mut reg = Awareness::new(1);
        reg.set_local_state("{}");
        reg.apply_update(update(2, 1, Some("peer")));

        let active = reg.active_clients(Duration::from_secs(60));
        assert_eq!(active, vec![1, 2]);

        // A zero ttl leaves only the local client.
        let active = reg.active_clients(Duration::from_secs(0));
        assert_eq!(active, vec![1]);
    }
}
