use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use relay_core::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Name given to an agent when the pair request does not carry one.
pub const DEFAULT_AGENT_NAME: &str = "My Computer";

/// Ownership lookups the hub performs while routing.
pub trait AgentDirectory: Send + Sync {
    /// User that owns `token`, or `None` when the token was never paired.
    fn owner_of(&self, token: &str) -> Result<Option<i64>>;

    fn touch_last_seen(&self, token: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRecord {
    pub id: i64,
    pub user_id: i64,
    pub token: String,
    pub name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub paired_at: DateTime<Utc>,
}

/// SQLite-backed accounts, sessions, pairing codes and paired agents.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    db_path: PathBuf,
}

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::Storage(format!("{}: {}", context, e))
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::Auth(format!("Failed to hash password: {}", e)))
}

fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            debug!(error = %e, "Stored password hash is not a PHC string");
            false
        }
    }
}

fn random_session_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn random_pairing_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(db_path).map_err(storage_err("Failed to open db"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;").ok();

        let store = Self {
            inner: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        info!(path = %db_path.display(), "Store opened");
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.inner
            .lock()
            .map_err(|e| Error::Storage(format!("Lock error: {}", e)))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                agent_token TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL DEFAULT 'My Computer',
                last_seen INTEGER,
                paired_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agents_user ON agents(user_id);

            CREATE TABLE IF NOT EXISTS pairing_codes (
                code TEXT PRIMARY KEY,
                agent_token TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            ",
        )
        .map_err(storage_err("Failed to init schema"))?;
        Ok(())
    }

    // ---- users ----

    pub fn create_user(&self, username: &str, password: &str) -> Result<i64> {
        if username.trim().is_empty() {
            return Err(Error::Validation("username must not be empty".to_string()));
        }
        let hash = hash_password(password)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
            params![username, hash, Utc::now().timestamp()],
        )
        .map_err(storage_err("Create user error"))?;
        let id = conn.last_insert_rowid();
        info!(user_id = id, username = %username, "User created");
        Ok(id)
    }

    /// Create the account unless a user with that name already exists.
    /// Returns `true` when a new row was inserted.
    pub fn ensure_user(&self, username: &str, password: &str) -> Result<bool> {
        let hash = hash_password(password)?;
        let conn = self.conn()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO users (username, password_hash, created_at) VALUES (?1, ?2, ?3)",
                params![username, hash, Utc::now().timestamp()],
            )
            .map_err(storage_err("Ensure user error"))?;
        Ok(inserted > 0)
    }

    pub fn set_password(&self, username: &str, password: &str) -> Result<()> {
        let hash = hash_password(password)?;
        let conn = self.conn()?;
        let affected = conn
            .execute(
                "UPDATE users SET password_hash = ?1 WHERE username = ?2",
                params![hash, username],
            )
            .map_err(storage_err("Set password error"))?;
        if affected == 0 {
            return Err(Error::NotFound(format!("user {}", username)));
        }
        Ok(())
    }

    pub fn validate_user(&self, username: &str, password: &str) -> Result<Option<i64>> {
        let row: Option<(i64, String)> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id, password_hash FROM users WHERE username = ?1",
                params![username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err("Validate user error"))?
        };

        Ok(row.and_then(|(id, hash)| verify_password(password, &hash).then_some(id)))
    }

    // ---- sessions ----

    pub fn create_session(&self, user_id: i64, ttl: Duration) -> Result<String> {
        let token = random_session_token();
        let now = Utc::now().timestamp();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sessions (token, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![token, user_id, now, now + ttl.as_secs() as i64],
        )
        .map_err(storage_err("Create session error"))?;
        Ok(token)
    }

    /// Owner of a live session. Expired sessions are removed on lookup.
    pub fn validate_session(&self, token: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT user_id, expires_at FROM sessions WHERE token = ?1",
                params![token],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(storage_err("Validate session error"))?;

        match row {
            Some((user_id, expires_at)) if expires_at > Utc::now().timestamp() => Ok(Some(user_id)),
            Some(_) => {
                conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
                    .map_err(storage_err("Delete session error"))?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn delete_session(&self, token: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE token = ?1", params![token])
            .map_err(storage_err("Delete session error"))?;
        Ok(())
    }

    // ---- pairing codes ----

    /// Issue a 6-digit code for `agent_token`, replacing any earlier one.
    pub fn create_pairing_code(&self, agent_token: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now().timestamp();
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err("Begin pairing error"))?;
        tx.execute(
            "DELETE FROM pairing_codes WHERE agent_token = ?1",
            params![agent_token],
        )
        .map_err(storage_err("Replace pairing code error"))?;

        let mut code = random_pairing_code();
        loop {
            let taken: bool = tx
                .query_row(
                    "SELECT 1 FROM pairing_codes WHERE code = ?1",
                    params![code],
                    |_| Ok(true),
                )
                .optional()
                .map_err(storage_err("Pairing code lookup error"))?
                .unwrap_or(false);
            if !taken {
                break;
            }
            code = random_pairing_code();
        }

        tx.execute(
            "INSERT INTO pairing_codes (code, agent_token, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![code, agent_token, now, now + ttl.as_secs() as i64],
        )
        .map_err(storage_err("Create pairing code error"))?;
        tx.commit().map_err(storage_err("Commit pairing error"))?;
        Ok(code)
    }

    /// Agent token bound to an unexpired code.
    pub fn validate_pairing_code(&self, code: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT agent_token FROM pairing_codes WHERE code = ?1 AND expires_at > ?2",
            params![code, Utc::now().timestamp()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err("Validate pairing code error"))
    }

    pub fn delete_pairing_code(&self, code: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM pairing_codes WHERE code = ?1", params![code])
            .map_err(storage_err("Delete pairing code error"))?;
        Ok(())
    }

    pub fn purge_expired_pairing_codes(&self) -> Result<usize> {
        let conn = self.conn()?;
        let purged = conn
            .execute(
                "DELETE FROM pairing_codes WHERE expires_at <= ?1",
                params![Utc::now().timestamp()],
            )
            .map_err(storage_err("Purge pairing codes error"))?;
        if purged > 0 {
            debug!(count = purged, "Purged expired pairing codes");
        }
        Ok(purged)
    }

    // ---- agents ----

    /// Bind `agent_token` to `user_id`. Re-pairing a token moves it to the
    /// new owner and renames it.
    pub fn pair_agent(&self, user_id: i64, agent_token: &str, name: &str) -> Result<AgentRecord> {
        let name = if name.trim().is_empty() { DEFAULT_AGENT_NAME } else { name.trim() };
        let now = Utc::now().timestamp();
        {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO agents (user_id, agent_token, name, paired_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(agent_token) DO UPDATE SET user_id = excluded.user_id,
                     name = excluded.name, paired_at = excluded.paired_at",
                params![user_id, agent_token, name, now],
            )
            .map_err(storage_err("Pair agent error"))?;
        }
        info!(user_id, agent = %relay_core::short_token(agent_token), "Agent paired");
        self.get_agent_by_token(agent_token)?
            .ok_or_else(|| Error::Storage("paired agent row missing".to_string()))
    }

    pub fn list_user_agents(&self, user_id: i64) -> Result<Vec<AgentRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, agent_token, name, last_seen, paired_at
                 FROM agents WHERE user_id = ?1 ORDER BY id",
            )
            .map_err(storage_err("Prepare error"))?;
        let rows = stmt
            .query_map(params![user_id], Self::row_to_agent)
            .map_err(storage_err("Query error"))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(storage_err("Row error"))
    }

    pub fn get_agent_by_token(&self, agent_token: &str) -> Result<Option<AgentRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, user_id, agent_token, name, last_seen, paired_at
             FROM agents WHERE agent_token = ?1",
            params![agent_token],
            Self::row_to_agent,
        )
        .optional()
        .map_err(storage_err("Get agent error"))
    }

    pub fn touch_agent_last_seen(&self, agent_token: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE agents SET last_seen = ?1 WHERE agent_token = ?2",
            params![Utc::now().timestamp(), agent_token],
        )
        .map_err(storage_err("Touch agent error"))?;
        Ok(())
    }

    /// Remove one of the user's agents. Returns `false` when `id` is not
    /// owned by `user_id`.
    pub fn delete_agent(&self, user_id: i64, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn
            .execute(
                "DELETE FROM agents WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(storage_err("Delete agent error"))?;
        Ok(affected > 0)
    }

    fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
        let last_seen: Option<i64> = row.get(4)?;
        Ok(AgentRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            token: row.get(2)?,
            name: row.get(3)?,
            last_seen: last_seen.map(from_unix),
            paired_at: from_unix(row.get(5)?),
        })
    }
}

impl AgentDirectory for Store {
    fn owner_of(&self, token: &str) -> Result<Option<i64>> {
        Ok(self.get_agent_by_token(token)?.map(|a| a.user_id))
    }

    fn touch_last_seen(&self, token: &str) -> Result<()> {
        self.touch_agent_last_seen(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("relay.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_user_password_flow() {
        let (store, _dir) = test_store();
        let id = store.create_user("alice", "s3cret").unwrap();

        assert_eq!(store.validate_user("alice", "s3cret").unwrap(), Some(id));
        assert_eq!(store.validate_user("alice", "wrong").unwrap(), None);
        assert_eq!(store.validate_user("bob", "s3cret").unwrap(), None);

        store.set_password("alice", "n3w").unwrap();
        assert_eq!(store.validate_user("alice", "s3cret").unwrap(), None);
        assert_eq!(store.validate_user("alice", "n3w").unwrap(), Some(id));

        assert!(matches!(store.set_password("bob", "x"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_ensure_user_is_idempotent() {
        let (store, _dir) = test_store();
        assert!(store.ensure_user("admin", "one").unwrap());
        assert!(!store.ensure_user("admin", "two").unwrap());
        // The first password stays in effect.
        assert!(store.validate_user("admin", "one").unwrap().is_some());
        assert!(store.create_user("admin", "three").is_err());
    }

    #[test]
    fn test_sessions() {
        let (store, _dir) = test_store();
        let user = store.create_user("alice", "pw").unwrap();

        let token = store.create_session(user, Duration::from_secs(3600)).unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(store.validate_session(&token).unwrap(), Some(user));

        store.delete_session(&token).unwrap();
        assert_eq!(store.validate_session(&token).unwrap(), None);

        let expired = store.create_session(user, Duration::from_secs(0)).unwrap();
        assert_eq!(store.validate_session(&expired).unwrap(), None);
    }

    #[test]
    fn test_pairing_code_replaces_previous() {
        let (store, _dir) = test_store();
        let first = store.create_pairing_code("agent_a", Duration::from_secs(300)).unwrap();
        assert_eq!(first.len(), 6);
        assert!(first.chars().all(|c| c.is_ascii_digit()));

        let second = store.create_pairing_code("agent_a", Duration::from_secs(300)).unwrap();
        assert_eq!(store.validate_pairing_code(&second).unwrap().as_deref(), Some("agent_a"));
        if first != second {
            assert_eq!(store.validate_pairing_code(&first).unwrap(), None);
        }

        store.delete_pairing_code(&second).unwrap();
        assert_eq!(store.validate_pairing_code(&second).unwrap(), None);
    }

    #[test]
    fn test_expired_pairing_codes() {
        let (store, _dir) = test_store();
        let code = store.create_pairing_code("agent_a", Duration::from_secs(0)).unwrap();
        assert_eq!(store.validate_pairing_code(&code).unwrap(), None);
        assert_eq!(store.purge_expired_pairing_codes().unwrap(), 1);
        assert_eq!(store.purge_expired_pairing_codes().unwrap(), 0);
    }

    #[test]
    fn test_pair_and_repair_agent() {
        let (store, _dir) = test_store();
        let alice = store.create_user("alice", "pw").unwrap();
        let bob = store.create_user("bob", "pw").unwrap();

        let rec = store.pair_agent(alice, "agent_x", "").unwrap();
        assert_eq!(rec.name, DEFAULT_AGENT_NAME);
        assert_eq!(rec.user_id, alice);
        assert_eq!(store.owner_of("agent_x").unwrap(), Some(alice));

        let rec2 = store.pair_agent(bob, "agent_x", "Office PC").unwrap();
        assert_eq!(rec2.id, rec.id);
        assert_eq!(rec2.name, "Office PC");
        assert_eq!(store.owner_of("agent_x").unwrap(), Some(bob));
        assert!(store.list_user_agents(alice).unwrap().is_empty());
        assert_eq!(store.list_user_agents(bob).unwrap().len(), 1);
        assert_eq!(store.owner_of("agent_unknown").unwrap(), None);
    }

    #[test]
    fn test_last_seen_and_delete() {
        let (store, _dir) = test_store();
        let alice = store.create_user("alice", "pw").unwrap();
        let bob = store.create_user("bob", "pw").unwrap();
        let rec = store.pair_agent(alice, "agent_x", "Laptop").unwrap();
        assert!(rec.last_seen.is_none());

        store.touch_last_seen("agent_x").unwrap();
        let rec = store.get_agent_by_token("agent_x").unwrap().unwrap();
        assert!(rec.last_seen.is_some());

        assert!(!store.delete_agent(bob, rec.id).unwrap());
        assert!(store.delete_agent(alice, rec.id).unwrap());
        assert!(store.get_agent_by_token("agent_x").unwrap().is_none());
    }
}
