//! # Session Store
//!
//! Durable storage for channel sessions, built on sled's embedded
//! key-value store. One tree, `sessions`, keyed by room id (UTF-8) with
//! bincode-serialized [`Session`] values.
//!
//! ## Write discipline
//!
//! The channel protocol calls [`SessionStore::save`] after every accepted
//! state mutation and **before** the outbound message that reveals the new
//! state. A crash mid-handshake therefore never loses a state the
//! counterparty has already seen — the worst case is re-sending a message
//! the peer deduplicates by version. A failed save aborts the operation
//! entirely; nothing is sent on top of an unpersisted state.

use std::path::Path;

use sled::{Db, Tree};

use crate::channel::session::Session;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during session store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Shorthand result for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

/// Persistent storage for channel sessions.
///
/// # Thread Safety
///
/// sled trees support lock-free concurrent reads and serialized writes, so
/// a `SessionStore` can be shared via `Arc` without external locking. In
/// practice each session's event loop is the only writer for its room key.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Tree,
    db: Db,
}

impl SessionStore {
    /// Opens or creates a store at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Creates a temporary store that lives in memory and disappears on
    /// drop. Ideal for tests — no filesystem side effects, no cleanup.
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let sessions = db.open_tree("sessions")?;
        Ok(SessionStore { sessions, db })
    }

    /// Returns the last persisted session for a room, or `None` if this
    /// peer never initialized one.
    pub fn load(&self, room_id: &str) -> StoreResult<Option<Session>> {
        match self.sessions.get(room_id.as_bytes())? {
            Some(bytes) => {
                let session = bincode::deserialize(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Persists a session, overwriting any previous record for its room.
    /// Flushes to durable storage before returning.
    pub fn save(&self, session: &Session) -> StoreResult<()> {
        let bytes = bincode::serialize(session)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.sessions.insert(session.room_id.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Destroys the session record for a room. Called on explicit close
    /// and local wipe; a no-op if nothing was stored.
    pub fn delete(&self, room_id: &str) -> StoreResult<()> {
        self.sessions.remove(room_id.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    /// Room ids with a persisted session, for listing local rooms.
    pub fn rooms(&self) -> StoreResult<Vec<String>> {
        let mut rooms = Vec::new();
        for entry in self.sessions.iter() {
            let (key, _) = entry?;
            rooms.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(rooms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::session::Role;
    use crate::channel::state::ChannelState;
    use crate::ledger::Seed;

    fn sample_session(room: &str) -> Session {
        let state = ChannelState {
            version: 4,
            deposit_amount: 50,
            tx_count_limit: 100,
            ..ChannelState::default()
        };
        Session::new(Role::Slave, Seed::generate(), room, state)
    }

    #[test]
    fn save_load_round_trip_is_identity() {
        let store = SessionStore::open_temporary().unwrap();
        let session = sample_session("room-rt");

        store.save(&session).unwrap();
        let loaded = store.load("room-rt").unwrap().expect("session exists");
        assert_eq!(loaded, session);
    }

    #[test]
    fn load_unknown_room_is_none() {
        let store = SessionStore::open_temporary().unwrap();
        assert!(store.load("never-initialized").unwrap().is_none());
    }

    #[test]
    fn save_overwrites_by_room() {
        let store = SessionStore::open_temporary().unwrap();
        let mut session = sample_session("room-ow");
        store.save(&session).unwrap();

        session.full_deposit_made = true;
        store.save(&session).unwrap();

        let loaded = store.load("room-ow").unwrap().unwrap();
        assert!(loaded.full_deposit_made);
        assert_eq!(store.rooms().unwrap(), vec!["room-ow".to_string()]);
    }

    #[test]
    fn delete_destroys_the_record() {
        let store = SessionStore::open_temporary().unwrap();
        store.save(&sample_session("room-del")).unwrap();
        store.delete("room-del").unwrap();
        assert!(store.load("room-del").unwrap().is_none());

        // Deleting again is fine.
        store.delete("room-del").unwrap();
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let session = sample_session("room-disk");
        {
            let store = SessionStore::open(dir.path()).unwrap();
            store.save(&session).unwrap();
        }
        let store = SessionStore::open(dir.path()).unwrap();
        let loaded = store.load("room-disk").unwrap().unwrap();
        assert_eq!(loaded, session);
    }
}
