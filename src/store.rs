use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::record::{
    cell_text, expiration_of, present, sort_by_expiration, FlatRecord, LicenseRecord, CURRENT_URL,
    SCRAPE_TIME, SENTINEL,
};

pub const JSON_FILE: &str = "crawl_data.json";
pub const CSV_FILE: &str = "data.csv";

const SCRAPE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Which fields decide that two records describe the same license.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKey {
    /// The record's detail link.
    Url,
    /// The `(city, address1)` pair.
    CityAddress,
}

impl IdentityKey {
    pub fn key_for(self, record: &FlatRecord) -> Option<String> {
        match self {
            IdentityKey::Url => present(record, CURRENT_URL).map(|url| format!("url:{url}")),
            IdentityKey::CityAddress => {
                let city = present(record, "city");
                let address = present(record, "address1");
                if city.is_none() && address.is_none() {
                    return None;
                }
                Some(format!(
                    "addr:{}|{}",
                    city.unwrap_or(SENTINEL),
                    address.unwrap_or(SENTINEL)
                ))
            }
        }
    }

    /// Identity key, or a fingerprint of every value when the key fields are absent.
    pub fn dedup_key(self, record: &FlatRecord) -> String {
        self.key_for(record).unwrap_or_else(|| fingerprint(record))
    }
}

fn fingerprint(record: &FlatRecord) -> String {
    let parts: Vec<String> = record
        .iter()
        .filter(|(k, _)| k.as_str() != SCRAPE_TIME)
        .map(|(k, v)| format!("{k}={}", cell_text(v)))
        .collect();
    format!("fp:{}", parts.join("\u{1f}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
}

/// Deduplicated record set persisted as a JSON log plus a CSV projection.
pub struct RecordStore {
    dir: PathBuf,
    identity: IdentityKey,
    records: Vec<FlatRecord>,
    known: HashSet<String>,
}

impl RecordStore {
    /// Open (or create) the store under `dir`, loading records from earlier runs.
    pub fn open(dir: impl Into<PathBuf>, identity: IdentityKey) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating output directory {}", dir.display()))?;
        let records = load_records(&dir.join(JSON_FILE))?;
        let known = records.iter().map(|r| identity.dedup_key(r)).collect();
        debug!(dir = %dir.display(), records = records.len(), "record store opened");
        Ok(Self {
            dir,
            identity,
            records,
            known,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[FlatRecord] {
        &self.records
    }

    pub fn json_path(&self) -> PathBuf {
        self.dir.join(JSON_FILE)
    }

    pub fn csv_path(&self) -> PathBuf {
        self.dir.join(CSV_FILE)
    }

    /// Normalize and persist a record unless its identity key is already known.
    /// The first-seen copy always wins; nothing is merged into it.
    pub fn ingest(&mut self, record: &LicenseRecord) -> Result<IngestOutcome> {
        let mut flat = record.flatten();
        let key = self.identity.dedup_key(&flat);
        if self.known.contains(&key) {
            debug!(key = %key, "duplicate record");
            return Ok(IngestOutcome::Duplicate);
        }

        flat.insert(
            SCRAPE_TIME.to_string(),
            Value::String(Local::now().format(SCRAPE_TIME_FORMAT).to_string()),
        );
        self.records.push(flat);
        self.known.insert(key.clone());

        if let Err(e) = self.persist() {
            self.records.pop();
            self.known.remove(&key);
            // the CSV may already hold the record the log never got
            if let Err(restore) = write_csv(&self.csv_path(), &self.records) {
                warn!("could not restore {}: {:#}", self.csv_path().display(), restore);
            }
            return Err(e);
        }
        Ok(IngestOutcome::Inserted)
    }

    /// Write both files beside their targets first, then move them into place,
    /// the JSON log last. Temp files never outlive a failed attempt.
    fn persist(&self) -> Result<()> {
        let json = self.json_path();
        let csv = self.csv_path();
        let json_tmp = json.with_extension("json.tmp");
        let csv_tmp = csv.with_extension("csv.tmp");

        let result = write_json(&json_tmp, &self.records)
            .and_then(|()| write_csv(&csv_tmp, &self.records))
            .and_then(|()| {
                fs::rename(&csv_tmp, &csv).with_context(|| format!("replacing {}", csv.display()))
            })
            .and_then(|()| {
                fs::rename(&json_tmp, &json)
                    .with_context(|| format!("replacing {}", json.display()))
            });
        if result.is_err() {
            let _ = fs::remove_file(&json_tmp);
            let _ = fs::remove_file(&csv_tmp);
        }
        result
    }
}

/// Rebuild `data.csv` under `dir` from the JSON log.
pub fn export_csv(dir: &Path) -> Result<usize> {
    let records = load_records(&dir.join(JSON_FILE))?;
    let path = dir.join(CSV_FILE);
    let tmp = path.with_extension("csv.tmp");
    write_csv(&tmp, &records)?;
    fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
    info!(path = %path.display(), rows = records.len(), "CSV rewritten");
    Ok(records.len())
}

/// Records from a JSON log; a missing file is an empty store.
pub fn load_records(path: &Path) -> Result<Vec<FlatRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn write_json(path: &Path, records: &[FlatRecord]) -> Result<()> {
    let raw = serde_json::to_string_pretty(records)?;
    fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
}

/// Header is the union of all keys in first-seen order; rows are sorted by
/// expiration date, newest first, undated last.
pub fn write_csv(path: &Path, records: &[FlatRecord]) -> Result<()> {
    let mut header: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();
    for key in records.iter().flat_map(|r| r.keys()) {
        if seen.insert(key.as_str()) {
            header.push(key.as_str());
        }
    }

    let mut rows: Vec<&FlatRecord> = records.iter().collect();
    sort_by_expiration(&mut rows, true);

    let mut w = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    if !header.is_empty() {
        w.write_record(&header)?;
    }
    for r in rows {
        w.write_record(header.iter().map(|k| r.get(*k).map(cell_text).unwrap_or_default()))?;
    }
    w.flush()?;
    Ok(())
}

/// Records back from a CSV projection; empty cells are left out.
pub fn read_csv(path: &Path) -> Result<Vec<FlatRecord>> {
    let mut rdr = csv::Reader::from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let header = rdr.headers()?.clone();
    let mut out = Vec::new();
    for row in rdr.records() {
        let row = row?;
        let record: FlatRecord = header
            .iter()
            .zip(row.iter())
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        out.push(record);
    }
    Ok(out)
}

// ── Read-side projections ──

/// What a viewer shows: the CSV projection, or the JSON log if no CSV exists yet.
pub fn load_view_records(dir: &Path) -> Result<Vec<FlatRecord>> {
    let csv = dir.join(CSV_FILE);
    if csv.exists() {
        read_csv(&csv)
    } else {
        load_records(&dir.join(JSON_FILE))
    }
}

pub struct StoreStats {
    pub total: usize,
    pub with_expiration: usize,
    pub expired: usize,
}

pub fn stats(records: &[FlatRecord]) -> StoreStats {
    let today = Local::now().date_naive();
    let dates: Vec<_> = records.iter().filter_map(expiration_of).collect();
    StoreStats {
        total: records.len(),
        with_expiration: dates.len(),
        expired: dates.iter().filter(|d| **d < today).count(),
    }
}

/// Filters applied by the `view` command.
#[derive(Debug, Clone)]
pub struct ViewFilter {
    pub name: Option<String>,
    pub include_undated: bool,
    pub newest_first: bool,
    pub limit: Option<usize>,
}

impl Default for ViewFilter {
    fn default() -> Self {
        Self {
            name: None,
            include_undated: false,
            newest_first: true,
            limit: None,
        }
    }
}

impl ViewFilter {
    pub fn apply<'a>(&self, records: &'a [FlatRecord]) -> Vec<&'a FlatRecord> {
        let needle = self.name.as_ref().map(|n| n.to_lowercase());
        let mut out: Vec<&FlatRecord> = records
            .iter()
            .filter(|r| self.include_undated || expiration_of(r).is_some())
            .filter(|r| match &needle {
                Some(n) => present(r, "owner_name")
                    .map(|o| o.to_lowercase().contains(n.as_str()))
                    .unwrap_or(false),
                None => true,
            })
            .collect();
        sort_by_expiration(&mut out, self.newest_first);
        if let Some(n) = self.limit {
            out.truncate(n);
        }
        out
    }
}
