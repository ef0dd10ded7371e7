//! SQLite storage for the user/message API
//!
//! The relay itself keeps no state across restarts. This store backs the
//! optional HTTP endpoints for user lookup and chat history.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// A registered user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUser {
    pub email: String,
    pub name: String,
    /// Unix milliseconds
    pub created_at: i64,
}

/// A persisted chat message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub from: String,
    pub to: String,
    pub message: String,
    /// Unix milliseconds
    pub timestamp: i64,
}

/// SQLite storage backend
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a new SQLite database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                email TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender TEXT NOT NULL,
                recipient TEXT NOT NULL,
                body TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender, recipient);
            "#,
        )?;

        info!("Storage schema initialized");
        Ok(())
    }

    /// Register a new user. Emails are stored lowercase.
    pub fn register_user(&self, email: &str, name: &str) -> Result<StoredUser, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let email = email.trim().to_lowercase();
        let now = current_timestamp();

        let inserted = conn.execute(
            "INSERT OR IGNORE INTO users (email, name, created_at) VALUES (?1, ?2, ?3)",
            params![email, name.trim(), now],
        )?;
        if inserted == 0 {
            return Err(StorageError::UserExists(email));
        }

        debug!("User registered in storage: {}", email);
        Ok(StoredUser {
            email,
            name: name.trim().to_string(),
            created_at: now,
        })
    }

    /// Look up a user by email (case-insensitive)
    pub fn get_user(&self, email: &str) -> Result<Option<StoredUser>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let user = conn
            .query_row(
                "SELECT email, name, created_at FROM users WHERE email = ?1",
                params![email.trim().to_lowercase()],
                |row| {
                    Ok(StoredUser {
                        email: row.get(0)?,
                        name: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(user)
    }

    /// Persist a chat message
    pub fn insert_message(
        &self,
        from: &str,
        to: &str,
        message: &str,
    ) -> Result<StoredMessage, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        let now = current_timestamp();

        conn.execute(
            "INSERT INTO messages (sender, recipient, body, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![from, to, message, now],
        )?;

        Ok(StoredMessage {
            id: conn.last_insert_rowid(),
            from: from.to_string(),
            to: to.to_string(),
            message: message.to_string(),
            timestamp: now,
        })
    }

    /// Messages exchanged between two identities, in either direction, oldest first
    pub fn messages_between(&self, a: &str, b: &str) -> Result<Vec<StoredMessage>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let mut stmt = conn.prepare(
            "SELECT id, sender, recipient, body, timestamp FROM messages
             WHERE (sender = ?1 AND recipient = ?2) OR (sender = ?2 AND recipient = ?1)
             ORDER BY timestamp ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![a, b], |row| {
            Ok(StoredMessage {
                id: row.get(0)?,
                from: row.get(1)?,
                to: row.get(2)?,
                message: row.get(3)?,
                timestamp: row.get(4)?,
            })
        })?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Get total user count
    pub fn user_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Get total message count
    pub fn message_count(&self) -> Result<usize, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;

        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Current Unix time in milliseconds
fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Storage errors
#[derive(Debug)]
pub enum StorageError {
    Database(rusqlite::Error),
    /// A user with this email already exists
    UserExists(String),
    /// Mutex lock was poisoned (indicates a panic occurred while holding the lock)
    LockPoisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        error!("Database error: {:?}", e);
        StorageError::Database(e)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Database(e) => write!(f, "Database error: {}", e),
            StorageError::UserExists(email) => write!(f, "User {} already exists", email),
            StorageError::LockPoisoned => {
                write!(f, "Lock poisoned: a thread panicked while holding the lock")
            }
        }
    }
}

impl std::error::Error for StorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_creation() {
        let storage = Storage::in_memory().unwrap();
        assert_eq!(storage.user_count().unwrap(), 0);
        assert_eq!(storage.message_count().unwrap(), 0);
    }

    #[test]
    fn test_user_operations() {
        let storage = Storage::in_memory().unwrap();

        let user = storage.register_user("User1@Example.com", " John Doe ").unwrap();
        assert_eq!(user.email, "user1@example.com");
        assert_eq!(user.name, "John Doe");

        let loaded = storage.get_user("USER1@example.com").unwrap().unwrap();
        assert_eq!(loaded, user);
        assert!(storage.get_user("nobody@example.com").unwrap().is_none());

        assert!(matches!(
            storage.register_user("user1@example.com", "Someone Else"),
            Err(StorageError::UserExists(_))
        ));
        assert_eq!(storage.user_count().unwrap(), 1);
    }

    #[test]
    fn test_messages_between_pair() {
        let storage = Storage::in_memory().unwrap();

        storage.insert_message("a@example.com", "b@example.com", "hi").unwrap();
        storage.insert_message("b@example.com", "a@example.com", "hello").unwrap();
        storage.insert_message("a@example.com", "c@example.com", "elsewhere").unwrap();

        let history = storage.messages_between("a@example.com", "b@example.com").unwrap();
        let bodies: Vec<&str> = history.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["hi", "hello"]);

        // Same conversation from the other side
        let reversed = storage.messages_between("b@example.com", "a@example.com").unwrap();
        assert_eq!(reversed, history);
        assert_eq!(storage.message_count().unwrap(), 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signal.db");

        {
            let storage = Storage::open(&path).unwrap();
            storage.register_user("a@example.com", "Alice").unwrap();
            storage.insert_message("a@example.com", "b@example.com", "hi").unwrap();
        }

        let storage = Storage::open(&path).unwrap();
        assert!(storage.get_user("a@example.com").unwrap().is_some());
        assert_eq!(
            storage.messages_between("a@example.com", "b@example.com").unwrap().len(),
            1
        );
    }
}
