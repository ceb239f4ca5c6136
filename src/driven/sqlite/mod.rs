use std::{path::Path, str::FromStr, time::Duration};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::domain::Result;

pub mod signing_key;

/// How long a write waits for a peer holding the database lock before it
/// fails with a conflict.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteState {
    db: SqlitePool,
}

impl SqliteState {
    pub async fn new(path: &Path) -> Result<Self> {
        Self::open(path, BUSY_TIMEOUT).await
    }

    /// Opens a file database shared with other processes. WAL lets readers
    /// keep the last committed state while a rotation transaction is open.
    pub async fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        let db = SqlitePoolOptions::new().connect_with(options).await?;

        Ok(Self { db })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("src/driven/sqlite/migrations")
            .run(&self.db)
            .await?;

        Ok(())
    }

    /// In-memory database shared by every caller of the returned state.
    /// A single connection keeps the schema alive for the pool's lifetime.
    #[cfg(test)]
    pub async fn ephemeral() -> Result<Self> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let out = Self { db };
        out.migrate().await?;

        Ok(out)
    }

    /// Migrated file database under the system temp directory, reached
    /// through a multi-connection pool like the daemon's.
    #[cfg(test)]
    pub async fn temporary(busy_timeout: Duration) -> Result<(Self, tests::TempDatabase)> {
        let file = tests::TempDatabase::new();
        let out = Self::open(&file.path, busy_timeout).await?;
        out.migrate().await?;

        Ok((out, file))
    }
}

#[cfg(test)]
pub mod tests {
    use std::{fs, path::PathBuf};

    use uuid::Uuid;

    use super::*;

    /// Removes the database file and its WAL companions on drop.
    pub struct TempDatabase {
        pub path: PathBuf,
    }
    impl TempDatabase {
        pub fn new() -> Self {
            let path = std::env::temp_dir().join(format!("keyward-{}.db", Uuid::new_v4()));
            Self { path }
        }
    }
    impl Drop for TempDatabase {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let _ = fs::remove_file(format!("{}{suffix}", self.path.display()));
            }
        }
    }

    #[tokio::test]
    async fn it_should_open_file_database_in_wal_mode() {
        let (sqlite, _file) = SqliteState::temporary(BUSY_TIMEOUT).await.unwrap();

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode;")
            .fetch_one(&sqlite.db)
            .await
            .unwrap();

        assert_eq!(mode.to_lowercase(), "wal");
    }
}
