//! Async handle over the synchronous SQLite [`Database`].
//!
//! Every call runs on tokio's blocking pool so a slow disk never stalls the
//! socket tasks. The connection is shared behind a mutex; SQLite serialises
//! writers anyway.

use std::sync::Arc;

use parking_lot::Mutex;

use agora_store::{Database, StoreError};

use crate::error::ServerError;

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Database>>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `f` against the database on the blocking pool.
    pub async fn call<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let result = tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            f(&guard)
        })
        .await
        .map_err(|e| ServerError::Internal(format!("store task failed: {e}")))?;

        result.map_err(ServerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_maps_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(Database::open_at(&dir.path().join("agora.db")).unwrap());

        let user = store
            .call(|db| db.create_user("alice", "opaque-hash"))
            .await
            .unwrap();
        assert_eq!(user.username, "alice");

        let err = store
            .call(|db| db.get_room(agora_shared::types::RoomId(404)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(ref what) if what == "room"));
    }
}
