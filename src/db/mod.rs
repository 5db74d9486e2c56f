pub mod schema;

use rusqlite::{Connection, DatabaseName};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised by the SQLite-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to create database directory {path}: {source}")]
  Directory {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("serialization error: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("store lock poisoned")]
  Poisoned,

  #[error("corrupt row {id}: {reason}")]
  Corrupt { id: i64, reason: String },

  #[error("record {0} not found")]
  NotFound(i64),
}

/// Database connection wrapper shared by the queue and cache stores
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path` and apply `schema`.
  pub fn open(path: &Path, schema: &str) -> Result<Self, StoreError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let conn = Connection::open(path)?;
    configure(&conn)?;

    let db = Self { conn };
    db.run_migrations(schema)?;

    Ok(db)
  }

  /// Default location for a database file under the user data directory
  pub fn default_path(file_name: &str) -> Option<PathBuf> {
    data_dir().map(|dir| dir.join(file_name))
  }

  fn run_migrations(&self, schema: &str) -> Result<(), StoreError> {
    self.conn.execute_batch(schema)?;
    Ok(())
  }

  pub fn into_connection(self) -> Connection {
    self.conn
  }
}

/// `$XDG_DATA_HOME/fieldsync`, falling back to `~/.local/share/fieldsync`
pub fn data_dir() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|p| p.join("fieldsync"))
}

fn configure(conn: &Connection) -> rusqlite::Result<()> {
  conn.pragma_update(None::<DatabaseName>, "journal_mode", "WAL")?;
  // FULL: an acknowledged enqueue must survive power loss, not just a crash
  conn.pragma_update(None::<DatabaseName>, "synchronous", "FULL")?;
  conn.pragma_update(None::<DatabaseName>, "foreign_keys", "ON")?;
  conn.busy_timeout(Duration::from_millis(5000))?;
  Ok(())
}
