use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use diesel::OptionalExtension;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use dirs::home_dir;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use super::schema::transfers::{self, dsl as transfers_dsl};
use crate::transfer::{Direction, Transfer};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/transfers");

/// SQLite-backed cache of in-progress transfers, keyed by fingerprint and
/// direction. Records hold the serialized transfer blob so an interrupted
/// transfer resumes from its durable watermark after a restart.
pub struct TransferCache {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl TransferCache {
    /// Create or open the cache at the default location
    /// (~/.stratus/transfers.db)
    pub fn new() -> Result<Self> {
        let db_path = Self::get_db_path()?;
        Self::with_path(db_path)
    }

    /// Create or open the cache at a specific path. The schema is migrated
    /// to the latest version on startup.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create transfer cache parent dir {}", parent.display())
            })?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid transfer cache path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build transfer cache connection pool")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn get_db_path() -> Result<PathBuf> {
        let home = home_dir().ok_or_else(|| anyhow!("Unable to determine home directory"))?;
        Ok(home.join(".stratus").join("transfers.db"))
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool
            .get()
            .context("Failed to get connection from transfer cache pool")
    }

    /// Insert or update the record for a transfer (upsert on the cache key).
    pub fn store(&self, transfer: &Transfer) -> Result<()> {
        let mut conn = self.connection()?;
        let row = TransferRow::from_transfer(transfer);
        diesel::insert_into(transfers::table)
            .values(&row)
            .on_conflict(transfers::id)
            .do_update()
            .set((
                transfers_dsl::record.eq(&row.record),
                transfers_dsl::updated_at.eq(row.updated_at),
            ))
            .execute(&mut conn)
            .context("Failed to store transfer record")?;
        Ok(())
    }

    /// Load a transfer by its cache key. The caller supplies fresh temporary
    /// URLs; they are never persisted.
    pub fn load(&self, cache_key: &str) -> Result<Option<Transfer>> {
        let mut conn = self.connection()?;
        let row = transfers_dsl::transfers
            .filter(transfers_dsl::id.eq(cache_key))
            .first::<TransferQueryRow>(&mut conn)
            .optional()
            .context("Failed to query transfer record")?;

        row.map(|row| {
            let direction = Direction::from_str(&row.direction)
                .ok_or_else(|| anyhow!("Unknown transfer direction {}", row.direction))?;
            let blob = BASE64
                .decode(&row.record)
                .context("Failed to decode transfer record")?;
            Transfer::deserialize(direction, &blob)
                .ok_or_else(|| anyhow!("Corrupt transfer record for {}", row.id))
        })
        .transpose()
    }

    pub fn remove(&self, cache_key: &str) -> Result<()> {
        let mut conn = self.connection()?;
        diesel::delete(transfers_dsl::transfers.filter(transfers_dsl::id.eq(cache_key)))
            .execute(&mut conn)
            .context("Failed to delete transfer record")?;
        Ok(())
    }

    pub fn count(&self) -> Result<i64> {
        let mut conn = self.connection()?;
        transfers_dsl::transfers
            .count()
            .get_result(&mut conn)
            .context("Failed to count transfer records")
    }
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("Failed to open transfer cache at {}", database_url))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("Failed to run transfer cache migrations: {err}"))?;
    Ok(())
}

#[derive(Queryable)]
struct TransferQueryRow {
    id: String,
    direction: String,
    #[allow(dead_code)]
    local_path: String,
    record: String,
    #[allow(dead_code)]
    created_at: i64,
    #[allow(dead_code)]
    updated_at: i64,
}

#[derive(Insertable)]
#[diesel(table_name = transfers)]
struct TransferRow {
    id: String,
    direction: String,
    local_path: String,
    record: String,
    created_at: i64,
    updated_at: i64,
}

impl TransferRow {
    fn from_transfer(transfer: &Transfer) -> Self {
        let now = Utc::now().timestamp();
        Self {
            id: transfer.cache_key(),
            direction: transfer.direction.as_str().to_string(),
            local_path: transfer.local_path().to_string_lossy().into_owned(),
            record: BASE64.encode(transfer.serialize()),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FileFingerprint;
    use crate::transfer::FileSink;

    fn sample_transfer() -> Transfer {
        let fingerprint = FileFingerprint {
            size: 1 << 20,
            mtime: 1_700_000_000,
            crc: [1, 2, 3, 4],
        };
        let mut t = Transfer::new(
            Direction::Get,
            fingerprint,
            [9u8; 16],
            77,
            1234,
            FileSink::for_file("video.mp4", fingerprint),
            vec!["https://storage.example.com/dl/v".into()],
        );
        t.chunkmacs.insert(0, [1u8; 16]);
        t.chunkmacs.mark_finished(0);
        t.update_contiguous_progress();
        t
    }

    #[test]
    fn store_load_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TransferCache::with_path(dir.path().join("transfers.db")).unwrap();

        let transfer = sample_transfer();
        cache.store(&transfer).unwrap();
        assert_eq!(cache.count().unwrap(), 1);

        let loaded = cache.load(&transfer.cache_key()).unwrap().unwrap();
        assert_eq!(loaded.progresscompleted, transfer.progresscompleted);
        assert_eq!(loaded.transferkey, transfer.transferkey);
        assert_eq!(loaded.chunkmacs, transfer.chunkmacs);
        assert!(loaded.urls.is_empty());

        cache.remove(&transfer.cache_key()).unwrap();
        assert_eq!(cache.load(&transfer.cache_key()).unwrap(), None);
    }

    #[test]
    fn store_is_an_upsert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TransferCache::with_path(dir.path().join("transfers.db")).unwrap();

        let mut transfer = sample_transfer();
        cache.store(&transfer).unwrap();
        transfer.pos = 999_424;
        cache.store(&transfer).unwrap();

        assert_eq!(cache.count().unwrap(), 1);
        let loaded = cache.load(&transfer.cache_key()).unwrap().unwrap();
        assert_eq!(loaded.pos, 999_424);
    }
}
