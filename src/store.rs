use crate::classify::FeatureFlags;
use anyhow::Result;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable state for one monitored document. At most one live record exists
/// per document; soft-deactivation (`recheck_eligible = false`) is the
/// terminal state, never row deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: i64,
    pub document_id: String,
    pub author_name: String,
    /// None until a reply has actually been posted; a record with a failed
    /// initial post keeps None so the scheduler retries the post later.
    pub reply_id: Option<String>,
    pub document_created_ut: i64,
    pub current_flags: FeatureFlags,
    pub previous_flags: FeatureFlags,
    pub recheck_eligible: bool,
    pub deletable: bool,
}

#[derive(Debug, Clone)]
pub struct NewRecord {
    pub document_id: String,
    pub author_name: String,
    pub reply_id: Option<String>,
    pub document_created_ut: i64,
    pub current_flags: FeatureFlags,
}

/// CRUD contract the bot requires from its storage collaborator.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_record(&self, record: NewRecord) -> Result<i64>;
    async fn get_by_document_id(&self, document_id: &str) -> Result<Option<Record>>;
    /// Rows the scheduler must poll, i.e. exactly the `recheck_eligible` set.
    async fn list_eligible(&self) -> Result<Vec<Record>>;
    async fn update_flags(&self, id: i64, current: FeatureFlags, previous: FeatureFlags) -> Result<()>;
    async fn set_reply_id(&self, id: i64, reply_id: &str) -> Result<()>;
    async fn deactivate(&self, id: i64) -> Result<()>;
    async fn set_deletable_false(&self, id: i64) -> Result<()>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS record (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id TEXT NOT NULL UNIQUE,
    author_name TEXT NOT NULL,
    reply_id TEXT,
    document_created_ut INTEGER NOT NULL,
    current_flags INTEGER NOT NULL,
    previous_flags INTEGER NOT NULL DEFAULT 0,
    recheck_eligible INTEGER NOT NULL DEFAULT 1,
    deletable INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_record_recheck ON record(recheck_eligible);
";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SqliteStore> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<SqliteStore> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("record store connection lock poisoned"))
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        author_name: row.get("author_name")?,
        reply_id: row.get("reply_id")?,
        document_created_ut: row.get("document_created_ut")?,
        current_flags: FeatureFlags::from_bits(row.get::<_, u16>("current_flags")?),
        previous_flags: FeatureFlags::from_bits(row.get::<_, u16>("previous_flags")?),
        recheck_eligible: row.get("recheck_eligible")?,
        deletable: row.get("deletable")?,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn create_record(&self, record: NewRecord) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO record
                 (document_id, author_name, reply_id, document_created_ut,
                  current_flags, previous_flags, recheck_eligible, deletable)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 1, 1)",
            params![
                record.document_id,
                record.author_name,
                record.reply_id,
                record.document_created_ut,
                record.current_flags.bits(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_by_document_id(&self, document_id: &str) -> Result<Option<Record>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT * FROM record WHERE document_id = ?1",
                params![document_id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn list_eligible(&self) -> Result<Vec<Record>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT * FROM record WHERE recheck_eligible = 1")?;
        let rows = stmt.query_map([], record_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn update_flags(&self, id: i64, current: FeatureFlags, previous: FeatureFlags) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE record SET current_flags = ?1, previous_flags = ?2 WHERE id = ?3",
            params![current.bits(), previous.bits(), id],
        )?;
        Ok(())
    }

    async fn set_reply_id(&self, id: i64, reply_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE record SET reply_id = ?1 WHERE id = ?2",
            params![reply_id, id],
        )?;
        Ok(())
    }

    async fn deactivate(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE record SET recheck_eligible = 0 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    async fn set_deletable_false(&self, id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE record SET deletable = 0 WHERE id = ?1", params![id])?;
        Ok(())
    }
}

/// In-memory store. Backs the unit tests and `--test-string` style dry runs;
/// behaviour mirrors `SqliteStore`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    records: Vec<Record>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_record(&self, record: NewRecord) -> Result<i64> {
        let mut inner = self.lock()?;
        if inner.records.iter().any(|r| r.document_id == record.document_id) {
            anyhow::bail!("record already exists for document {}", record.document_id);
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(Record {
            id,
            document_id: record.document_id,
            author_name: record.author_name,
            reply_id: record.reply_id,
            document_created_ut: record.document_created_ut,
            current_flags: record.current_flags,
            previous_flags: FeatureFlags::EMPTY,
            recheck_eligible: true,
            deletable: true,
        });
        Ok(id)
    }

    async fn get_by_document_id(&self, document_id: &str) -> Result<Option<Record>> {
        let inner = self.lock()?;
        Ok(inner.records.iter().find(|r| r.document_id == document_id).cloned())
    }

    async fn list_eligible(&self) -> Result<Vec<Record>> {
        let inner = self.lock()?;
        Ok(inner.records.iter().filter(|r| r.recheck_eligible).cloned().collect())
    }

    async fn update_flags(&self, id: i64, current: FeatureFlags, previous: FeatureFlags) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(r) = inner.records.iter_mut().find(|r| r.id == id) {
            r.current_flags = current;
            r.previous_flags = previous;
        }
        Ok(())
    }

    async fn set_reply_id(&self, id: i64, reply_id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(r) = inner.records.iter_mut().find(|r| r.id == id) {
            r.reply_id = Some(reply_id.to_string());
        }
        Ok(())
    }

    async fn deactivate(&self, id: i64) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(r) = inner.records.iter_mut().find(|r| r.id == id) {
            r.recheck_eligible = false;
        }
        Ok(())
    }

    async fn set_deletable_false(&self, id: i64) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(r) = inner.records.iter_mut().find(|r| r.id == id) {
            r.deletable = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(document_id: &str) -> NewRecord {
        NewRecord {
            document_id: document_id.to_string(),
            author_name: "someone".to_string(),
            reply_id: None,
            document_created_ut: 1_700_000_000,
            current_flags: FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK,
        }
    }

    #[tokio::test]
    async fn sqlite_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.create_record(sample("abc123")).await.unwrap();

        let record = store.get_by_document_id("abc123").await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.reply_id, None);
        assert_eq!(record.current_flags, FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK);
        assert!(record.recheck_eligible);
        assert!(record.deletable);
    }

    #[tokio::test]
    async fn sqlite_rejects_duplicate_document() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_record(sample("abc123")).await.unwrap();
        assert!(store.create_record(sample("abc123")).await.is_err());
    }

    #[tokio::test]
    async fn sqlite_mutations() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.create_record(sample("abc123")).await.unwrap();

        store.set_reply_id(id, "r9").await.unwrap();
        store
            .update_flags(id, FeatureFlags::CODE_FENCE, FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK)
            .await
            .unwrap();
        store.set_deletable_false(id).await.unwrap();

        let record = store.get_by_document_id("abc123").await.unwrap().unwrap();
        assert_eq!(record.reply_id.as_deref(), Some("r9"));
        assert_eq!(record.current_flags, FeatureFlags::CODE_FENCE);
        assert_eq!(record.previous_flags, FeatureFlags::CODE_OUTSIDE_OF_CODE_BLOCK);
        assert!(!record.deletable);

        assert_eq!(store.list_eligible().await.unwrap().len(), 1);
        store.deactivate(id).await.unwrap();
        assert!(store.list_eligible().await.unwrap().is_empty());
        // Deactivation is soft; the row survives.
        assert!(store.get_by_document_id("abc123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sqlite_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_record(sample("abc123")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.get_by_document_id("abc123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_store_matches_contract() {
        let store = MemoryStore::new();
        let id = store.create_record(sample("abc123")).await.unwrap();
        assert!(store.create_record(sample("abc123")).await.is_err());

        store.set_reply_id(id, "r1").await.unwrap();
        store.deactivate(id).await.unwrap();
        let record = store.get_by_document_id("abc123").await.unwrap().unwrap();
        assert_eq!(record.reply_id.as_deref(), Some("r1"));
        assert!(!record.recheck_eligible);
        assert!(store.list_eligible().await.unwrap().is_empty());
    }
}
