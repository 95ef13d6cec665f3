use crate::core::fingerprint::Fingerprint;
use crate::core::hash::{HashConfig, PerceptualHash};
use crate::database::{
    CacheCounters, CacheEntry, CacheError, CacheStats, HashCache, default_cache_path,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const SCHEMA_VERSION: i32 = 1;
const COLUMNS: [&str; 6] = ["fingerprint", "algorithm", "bit_size", "path", "hash", "computed_at"];
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable hash cache in a single SQLite file.
///
/// Opening never fails. A file that is not a usable database leaves the cache
/// degraded: every lookup misses and stores are dropped until [`clear`]
/// rebuilds it.
///
/// [`clear`]: HashCache::clear
pub struct SqliteHashCache {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    degraded: AtomicBool,
    counters: CacheCounters,
}

impl SqliteHashCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (conn, error) = match Self::connect(&path) {
            Ok(conn) => (Some(conn), None),
            Err(e) => (None, Some(e)),
        };

        let cache = Self {
            path,
            conn: Mutex::new(conn),
            degraded: AtomicBool::new(false),
            counters: CacheCounters::default(),
        };
        match error {
            Some(error) => cache.degrade(&error),
            None => log::debug!("Opened hash cache at {}", cache.path.display()),
        }
        cache
    }

    /// Open the cache at `~/.unique_image_finder/hash_cache.db`.
    pub fn open_default() -> Result<Self, CacheError> {
        Ok(Self::open(default_cache_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path) -> Result<Connection, CacheError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::initialize_schema(&conn)?;
        Ok(conn)
    }

    fn initialize_schema(conn: &Connection) -> Result<(), CacheError> {
        let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

        let mut stmt = conn.prepare("PRAGMA table_info(perceptual_hashes)")?;
        let mut columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        columns.sort();

        let mut expected: Vec<String> = COLUMNS.iter().map(|c| c.to_string()).collect();
        expected.sort();

        if !columns.is_empty() && (columns != expected || version != SCHEMA_VERSION) {
            log::warn!(
                "Hash cache schema mismatch (version {}, columns {:?}); rebuilding",
                version,
                columns
            );
            conn.execute_batch("DROP TABLE IF EXISTS perceptual_hashes;")?;
        }

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS perceptual_hashes (
                fingerprint TEXT NOT NULL,
                algorithm TEXT NOT NULL,
                bit_size INTEGER NOT NULL,
                path TEXT NOT NULL,
                hash TEXT NOT NULL,
                computed_at TEXT NOT NULL,
                PRIMARY KEY (fingerprint, algorithm, bit_size)
            );
            CREATE INDEX IF NOT EXISTS idx_perceptual_hashes_path ON perceptual_hashes(path);",
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn degrade(&self, error: &CacheError) {
        if !self.degraded.swap(true, Ordering::SeqCst) {
            log::warn!(
                "Hash cache at {} is unusable, continuing without it: {}",
                self.path.display(),
                error
            );
        }
    }

    /// Run `f` on the live connection. Errors are logged and turned into
    /// `None`; corruption also degrades the cache.
    fn with_conn<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Option<T> {
        if self.is_degraded() {
            return None;
        }

        let mut guard = self.lock();
        let conn = guard.as_mut()?;
        match f(conn) {
            Ok(value) => Some(value),
            Err(e) if is_corruption(&e) => {
                *guard = None;
                self.degrade(&CacheError::from(e));
                None
            }
            Err(e) => {
                log::warn!("Hash cache {} failed: {}", operation, e);
                None
            }
        }
    }

    fn sidecar(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }
}

fn is_corruption(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase)
    )
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl HashCache for SqliteHashCache {
    fn lookup(&self, fingerprint: &Fingerprint, config: HashConfig) -> Option<PerceptualHash> {
        let found = self.entry(fingerprint, config).map(|entry| entry.hash);
        self.counters.record_lookup(found)
    }

    fn entry(&self, fingerprint: &Fingerprint, config: HashConfig) -> Option<CacheEntry> {
        let key = fingerprint.cache_key();
        let (path, hex, computed_at) = self
            .with_conn("lookup", |conn| {
                conn.query_row(
                    "SELECT path, hash, computed_at FROM perceptual_hashes
                     WHERE fingerprint = ?1 AND algorithm = ?2 AND bit_size = ?3",
                    params![key, config.algorithm().as_str(), config.bit_size()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .flatten()?;

        let hash = match PerceptualHash::from_hex(&hex, config.bit_length()) {
            Ok(hash) => hash,
            Err(e) => {
                log::debug!("Ignoring malformed cache entry for {}: {}", path, e);
                return None;
            }
        };
        let computed_at = DateTime::parse_from_rfc3339(&computed_at)
            .map(|time| time.with_timezone(&Utc))
            .unwrap_or_default();

        Some(CacheEntry {
            fingerprint: key,
            path: PathBuf::from(path),
            config,
            hash,
            computed_at,
        })
    }

    fn store(
        &self,
        fingerprint: &Fingerprint,
        path: &Path,
        config: HashConfig,
        hash: &PerceptualHash,
    ) {
        let key = fingerprint.cache_key();
        let path = path.to_string_lossy().into_owned();
        let algorithm = config.algorithm().as_str();

        let stored = self.with_conn("store", |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM perceptual_hashes
                 WHERE path = ?1 AND algorithm = ?2 AND bit_size = ?3 AND fingerprint <> ?4",
                params![path, algorithm, config.bit_size(), key],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO perceptual_hashes
                 (fingerprint, algorithm, bit_size, path, hash, computed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    key,
                    algorithm,
                    config.bit_size(),
                    path,
                    hash.to_hex(),
                    Utc::now().to_rfc3339()
                ],
            )?;
            tx.commit()
        });

        if stored.is_some() {
            self.counters.record_store();
        }
    }

    fn invalidate(&self, fingerprint: &Fingerprint) {
        let key = fingerprint.cache_key();
        self.with_conn("invalidate", |conn| {
            conn.execute("DELETE FROM perceptual_hashes WHERE fingerprint = ?1", params![key])
        });
    }

    fn invalidate_path(&self, path: &Path) -> usize {
        let path = path.to_string_lossy().into_owned();
        self.with_conn("invalidate", |conn| {
            conn.execute("DELETE FROM perceptual_hashes WHERE path = ?1", params![path])
        })
        .unwrap_or(0)
    }

    fn prune_missing(&self) -> usize {
        let paths = self
            .with_conn("prune", |conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT path FROM perceptual_hashes")?;
                let paths = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(paths)
            })
            .unwrap_or_default();

        // Existence checks run without holding the connection.
        let missing: Vec<String> = paths
            .into_iter()
            .filter(|path| !Path::new(path).exists())
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let removed = self
            .with_conn("prune", |conn| {
                let tx = conn.transaction()?;
                let mut removed = 0;
                {
                    let mut stmt = tx.prepare("DELETE FROM perceptual_hashes WHERE path = ?1")?;
                    for path in &missing {
                        removed += stmt.execute(params![path])?;
                    }
                }
                tx.commit()?;
                Ok(removed)
            })
            .unwrap_or(0);

        log::info!(
            "Pruned {} cached hash(es) for {} missing file(s)",
            removed,
            missing.len()
        );
        removed
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut guard = self.lock();
        if !self.is_degraded() {
            if let Some(conn) = guard.as_mut() {
                conn.execute("DELETE FROM perceptual_hashes", [])?;
                log::info!("Cleared hash cache at {}", self.path.display());
                return Ok(());
            }
        }

        // Unusable file: start over.
        *guard = None;
        for suffix in ["", "-wal", "-shm"] {
            remove_if_exists(&self.sidecar(suffix))?;
        }
        *guard = Some(Self::connect(&self.path)?);
        self.degraded.store(false, Ordering::SeqCst);
        log::info!("Rebuilt hash cache at {}", self.path.display());
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        let entries = self
            .with_conn("stats", |conn| {
                conn.query_row("SELECT COUNT(*) FROM perceptual_hashes", [], |row| {
                    row.get::<_, i64>(0)
                })
            })
            .unwrap_or(0);
        self.counters.snapshot(entries.max(0) as u64, self.is_degraded())
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.with_conn("checkpoint", |conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        });
    }
}
