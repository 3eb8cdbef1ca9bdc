use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use weft_core::ids::SessionKey;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Durable per-conversation state, keyed by `(agent, session_id)`.
/// The state blob is opaque JSON owned by the agent runner.
pub struct ConversationRepo {
    db: Database,
}

impl ConversationRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Load the state for a conversation, or None if it has never run.
    #[instrument(skip(self), fields(key = %key))]
    pub fn get(&self, key: &SessionKey) -> Result<Option<Value>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT state FROM conversations WHERE agent = ?1 AND session_id = ?2",
            )?;
            let mut rows = stmt.query([key.agent.as_str(), key.session.as_str()])?;
            match rows.next()? {
                Some(row) => {
                    let raw: String = row_helpers::get(row, 0, "conversations", "state")?;
                    Ok(Some(row_helpers::parse_json(&raw, "conversations", "state")?))
                }
                None => Ok(None),
            }
        })
    }

    /// Upsert the full state for a conversation. A single statement, so the
    /// write is atomic with respect to concurrent readers of the same key.
    #[instrument(skip(self, state), fields(key = %key))]
    pub fn put(&self, key: &SessionKey, state: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (agent, session_id, state, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent, session_id) DO UPDATE SET
                     state = excluded.state,
                     updated_at = excluded.updated_at",
                rusqlite::params![key.agent.as_str(), key.session.as_str(), raw, now],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::ids::{AgentName, SessionId};

    fn setup() -> ConversationRepo {
        ConversationRepo::new(Database::in_memory().unwrap())
    }

    fn key(agent: &str, session: &str) -> SessionKey {
        SessionKey::new(AgentName::new(agent), SessionId::from_raw(session))
    }

    #[test]
    fn get_missing_returns_none() {
        let repo = setup();
        assert!(repo.get(&key("writer", "sess_1")).unwrap().is_none());
    }

    #[test]
    fn put_then_get() {
        let repo = setup();
        let k = key("writer", "sess_1");
        let state = json!({"messages": [{"role": "user", "content": "hi"}]});
        repo.put(&k, &state).unwrap();
        assert_eq!(repo.get(&k).unwrap(), Some(state));
    }

    #[test]
    fn put_overwrites() {
        let repo = setup();
        let k = key("writer", "sess_1");
        repo.put(&k, &json!({"turn": 1})).unwrap();
        repo.put(&k, &json!({"turn": 2})).unwrap();
        assert_eq!(repo.get(&k).unwrap(), Some(json!({"turn": 2})));
    }

    #[test]
    fn keys_are_isolated() {
        let repo = setup();
        repo.put(&key("writer", "sess_1"), &json!({"a": 1})).unwrap();
        repo.put(&key("writer", "sess_2"), &json!({"b": 2})).unwrap();
        repo.put(&key("translator", "sess_1"), &json!({"c": 3})).unwrap();

        assert_eq!(repo.get(&key("writer", "sess_1")).unwrap(), Some(json!({"a": 1})));
        assert_eq!(repo.get(&key("writer", "sess_2")).unwrap(), Some(json!({"b": 2})));
        assert_eq!(repo.get(&key("translator", "sess_1")).unwrap(), Some(json!({"c": 3})));
    }

    #[test]
    fn corrupt_state_is_reported() {
        let repo = setup();
        let k = key("writer", "sess_1");
        repo.db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO conversations (agent, session_id, state, updated_at)
                     VALUES ('writer', 'sess_1', 'not json', '2026-01-01T00:00:00Z')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
        assert!(matches!(
            repo.get(&k),
            Err(StoreError::CorruptRow { table: "conversations", .. })
        ));
    }
}
