//! Persistent enhancement ledger.
//!
//! Uses LMDB (via heed) to record, per output file, what was written there:
//! source and output digests, the pass list and when. The ledger only feeds
//! `stats` and diagnostics; idempotency comes from the in-class marker, and
//! the per-run descriptor cache is never persisted here.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, RoTxn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub const UNITS_DB: &str = "units";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub unit: String,
    pub source_sha256: String,
    pub output_sha256: String,
    pub enhancers: Vec<String>,
    pub recorded_at: u64,
}

impl LedgerRow {
    pub fn now(
        unit: impl Into<String>,
        source_sha256: String,
        output_sha256: String,
        enhancers: Vec<String>,
    ) -> Self {
        let recorded_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            unit: unit.into(),
            source_sha256,
            output_sha256,
            enhancers,
            recorded_at,
        }
    }
}

#[derive(Debug)]
pub struct Ledger {
    env: Arc<Env>,
    db_path: PathBuf,
    units: StrDb,
}

impl Ledger {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create ledger directory: {}", parent.display())
            })?;
        }

        let env = Arc::new(open_env(&db_path)?);
        let mut wtxn = env.write_txn()?;
        let units = env.create_database::<Str, Str>(&mut wtxn, Some(UNITS_DB))?;
        wtxn.commit()?;

        Ok(Self { env, db_path, units })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn record(&self, output: &Path, row: &LedgerRow) -> Result<()> {
        let key = output_key(output);
        let value = serde_json::to_string(row)?;
        let mut wtxn = self.env.write_txn()?;
        self.units.put(&mut wtxn, key.as_str(), value.as_str())?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn get(&self, output: &Path) -> Result<Option<LedgerRow>> {
        let key = output_key(output);
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.units.get(&rtxn, key.as_str())? else {
            return Ok(None);
        };
        let row = serde_json::from_str(raw)
            .with_context(|| format!("Failed to parse ledger row for {key}"))?;
        Ok(Some(row))
    }

    pub fn stats(&self) -> Result<LedgerStats> {
        let rtxn = self.env.read_txn()?;
        let units = table_len(&self.units, &rtxn)?;
        let mut by_enhancer: BTreeMap<String, u64> = BTreeMap::new();
        let mut last_recorded_at = None;
        for item in self.units.iter(&rtxn)? {
            let (_, v) = item?;
            let Ok(row) = serde_json::from_str::<LedgerRow>(v) else {
                continue;
            };
            for id in row.enhancers {
                *by_enhancer.entry(id).or_default() += 1;
            }
            last_recorded_at = last_recorded_at.max(Some(row.recorded_at));
        }
        Ok(LedgerStats {
            db_path: self.db_path.to_string_lossy().to_string(),
            units,
            by_enhancer,
            last_recorded_at,
        })
    }
}

/// Removes the ledger file and its lock file.
pub fn clear(db_path: &Path) -> Result<()> {
    remove_file_if_exists(db_path, "ledger")?;
    remove_file_if_exists(&lmdb_lock_path(db_path), "ledger lock")?;
    Ok(())
}

pub fn default_ledger_path() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("class-enhancer").join("ledger.lmdb"))
}

fn output_key(output: &Path) -> String {
    let absolute = std::path::absolute(output).unwrap_or_else(|_| output.to_path_buf());
    absolute.to_string_lossy().to_string()
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the ledger a single file next to its lock file.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open ledger env: {}", db_path.display()))
    }
}

fn table_len(db: &StrDb, rtxn: &RoTxn<'_>) -> Result<u64> {
    let mut count = 0u64;
    for item in db.iter(rtxn)? {
        let _ = item?;
        count += 1;
    }
    Ok(count)
}

fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct LedgerStats {
    pub db_path: String,
    pub units: u64,
    pub by_enhancer: BTreeMap<String, u64>,
    pub last_recorded_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "class_enhancer_test_{}_{}_{}.lmdb",
            std::process::id(),
            nanos,
            name
        ))
    }

    #[test]
    fn record_then_get_and_stats() -> Result<()> {
        let db_path = temp_db_path("ledger_record");
        let ledger = Ledger::open(db_path.clone())?;

        let out = PathBuf::from("/tmp/out/a/Foo.class");
        let row = LedgerRow::now(
            "a.Foo",
            "aa".to_string(),
            "bb".to_string(),
            vec!["orm@1".to_string(), "reload-stamp@1".to_string()],
        );
        ledger.record(&out, &row)?;
        assert_eq!(ledger.get(&out)?, Some(row.clone()));
        assert_eq!(ledger.get(Path::new("/tmp/out/a/Bar.class"))?, None);

        ledger.record(
            Path::new("/tmp/out/a/Bar.class"),
            &LedgerRow::now("a.Bar", "cc".to_string(), "dd".to_string(), vec!["orm@1".to_string()]),
        )?;
        let stats = ledger.stats()?;
        assert_eq!(stats.units, 2);
        assert_eq!(stats.by_enhancer.get("orm@1"), Some(&2));
        assert_eq!(stats.by_enhancer.get("reload-stamp@1"), Some(&1));

        drop(ledger);
        clear(&db_path)?;
        assert!(!db_path.exists());
        Ok(())
    }

    #[test]
    fn rerecording_replaces_row() -> Result<()> {
        let db_path = temp_db_path("ledger_replace");
        let ledger = Ledger::open(db_path.clone())?;
        let out = PathBuf::from("/tmp/out/Foo.class");
        ledger.record(&out, &LedgerRow::now("Foo", "1".into(), "2".into(), Vec::new()))?;
        ledger.record(&out, &LedgerRow::now("Foo", "3".into(), "4".into(), Vec::new()))?;
        assert_eq!(ledger.stats()?.units, 1);
        assert_eq!(ledger.get(&out)?.map(|r| r.output_sha256), Some("4".to_string()));

        drop(ledger);
        clear(&db_path)?;
        Ok(())
    }
}
