//! VI ALA ledger: sequential study identifiers and their records.
//!
//! Every viability study gets an id of the form `VI ALA-0000123`. The next
//! number is always one past the highest already on record, discovered by a
//! full scan rather than a stored counter, so the sequence survives manual
//! edits to the workbook. Records live in the `vi_ala` table with an Excel
//! fallback at `base_VI ALA.xlsx`.
//!
//! Callers must hold the ledger lock around [`next_id`] and the Excel write
//! path, otherwise two concurrent studies can mint the same id.

use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;
use crate::normalize;
use crate::remote::{RemoteStore, SCAN_PAGE};
use crate::xlsx::{self, Cell, SheetWriter};

/// Remote table name.
pub const TABLE: &str = "vi_ala";
/// File name of the Excel fallback inside the data directory.
pub const FILE_NAME: &str = "base_VI ALA.xlsx";
/// Column headers of the ledger workbook.
pub const HEADERS: [&str; 8] = [
    "VI ALA",
    "ALA",
    "DATA",
    "PROJETISTA",
    "CIDADE",
    "ENDEREÇO",
    "LATITUDE",
    "LONGITUDE",
];
/// How many entries the recent-list endpoint returns.
pub const RECENT_LIMIT: usize = 10;

lazy_static! {
    /// Matches ids in any of the spellings seen in the wild:
    /// `VI ALA-0000001`, `vi ala 1`, `VIALA-0000001`.
    static ref ID_RE: Regex = Regex::new(r"(?i)VI\s*ALA[-\s]*(\d+)").unwrap();
}

/// One ledger record, all fields in display form (dates `DD/MM/YYYY`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerEntry {
    pub vi_ala: String,
    pub ala: String,
    pub data: String,
    pub projetista: String,
    pub cidade: String,
    pub endereco: String,
    pub latitude: String,
    pub longitude: String,
}

/// Shape the frontend consumes when listing recent studies.
#[derive(Debug, Serialize)]
pub struct LedgerSummary {
    pub id: String,
    pub numero: u64,
    pub numero_ala: String,
    pub projetista: String,
    pub cidade: String,
    pub endereco: String,
    pub data_geracao: String,
    pub latitude: String,
    pub longitude: String,
}

impl LedgerEntry {
    fn cells(&self) -> Vec<Cell> {
        [
            &self.vi_ala,
            &self.ala,
            &self.data,
            &self.projetista,
            &self.cidade,
            &self.endereco,
            &self.latitude,
            &self.longitude,
        ]
        .iter()
        .map(|s| Cell::Text((*s).clone()))
        .collect()
    }

    /// Row shape the remote table expects: snake_case keys, ISO date,
    /// numeric coordinates, empty optionals as null.
    pub fn to_remote_row(&self) -> Value {
        fn opt(s: &str) -> Value {
            let t = s.trim();
            if t.is_empty() {
                Value::Null
            } else {
                Value::String(t.to_string())
            }
        }
        fn num(s: &str) -> Value {
            s.trim()
                .replace(',', ".")
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
        serde_json::json!({
            "vi_ala": self.vi_ala.trim(),
            "ala": opt(&self.ala),
            "data": normalize::to_iso_date(&self.data).map(Value::String).unwrap_or(Value::Null),
            "projetista": opt(&self.projetista),
            "cidade": opt(&self.cidade),
            "endereco": opt(&self.endereco),
            "latitude": num(&self.latitude),
            "longitude": num(&self.longitude),
        })
    }

    /// Flattens to the listing shape, extracting the sequence number.
    pub fn summary(&self) -> LedgerSummary {
        LedgerSummary {
            id: self.vi_ala.clone(),
            numero: extract_number(&self.vi_ala).unwrap_or(0),
            numero_ala: self.ala.clone(),
            projetista: self.projetista.clone(),
            cidade: self.cidade.clone(),
            endereco: self.endereco.clone(),
            data_geracao: self.data.clone(),
            latitude: self.latitude.clone(),
            longitude: self.longitude.clone(),
        }
    }
}

/// Pulls the sequence number out of an id, if the text carries one.
pub fn extract_number(text: &str) -> Option<u64> {
    ID_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

/// Formats a sequence number as a canonical id.
pub fn format_id(number: u64) -> String {
    format!("VI ALA-{:07}", number)
}

/// Path of the Excel fallback.
pub fn file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FILE_NAME)
}

/// Creates the ledger workbook with headers only if it does not exist.
/// Callers must hold the ledger lock.
pub fn ensure_file(data_dir: &Path) -> Result<(), AppError> {
    let path = file_path(data_dir);
    if path.exists() {
        return Ok(());
    }
    SheetWriter::with_headers("VI ALA", &HEADERS)?.finish_file(&path)?;
    log::info!("Created empty ledger workbook at {:?}", path);
    Ok(())
}

/// Reads every record from the Excel fallback, creating it first if needed.
pub fn read_file(data_dir: &Path) -> Result<Vec<LedgerEntry>, AppError> {
    ensure_file(data_dir)?;
    let range = xlsx::open_first_sheet(&file_path(data_dir))?;
    let text_at = |row: &[calamine::Data], idx: usize| {
        row.get(idx)
            .and_then(normalize::parse_string)
            .unwrap_or_default()
    };
    let entries = range
        .rows()
        .skip(1)
        .map(|row| LedgerEntry {
            vi_ala: text_at(row, 0),
            ala: text_at(row, 1),
            data: text_at(row, 2),
            projetista: text_at(row, 3),
            cidade: text_at(row, 4),
            endereco: text_at(row, 5),
            latitude: text_at(row, 6),
            longitude: text_at(row, 7),
        })
        .filter(|entry| !entry.vi_ala.is_empty())
        .collect();
    Ok(entries)
}

/// Appends one record to the Excel fallback. Callers must hold the ledger
/// lock, the workbook is rewritten whole.
pub fn append_file(data_dir: &Path, entry: &LedgerEntry) -> Result<(), AppError> {
    let mut entries = read_file(data_dir)?;
    entries.push(entry.clone());

    let mut writer = SheetWriter::with_headers("VI ALA", &HEADERS)?;
    for e in &entries {
        writer.push_row(&e.cells())?;
    }
    writer.finish_file(&file_path(data_dir))
}

/// Display timestamp for a remote row: `created_at` shifted to Brasília
/// time when present, otherwise the stored date flipped to `DD/MM/YYYY`.
fn display_date(row: &Value) -> String {
    if let Some(created) = row.get("created_at").and_then(Value::as_str) {
        if let Ok(utc) = created.parse::<DateTime<Utc>>() {
            let brt = FixedOffset::west_opt(3 * 3600).unwrap();
            return utc.with_timezone(&brt).format("%d/%m/%Y %H:%M").to_string();
        }
    }
    row.get("data")
        .and_then(Value::as_str)
        .map(normalize::to_display_date)
        .unwrap_or_default()
}

fn text_field(row: &Value, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

/// Converts a remote row to display form.
pub fn from_remote_row(row: &Value) -> LedgerEntry {
    LedgerEntry {
        vi_ala: text_field(row, "vi_ala"),
        ala: text_field(row, "ala"),
        data: display_date(row),
        projetista: text_field(row, "projetista"),
        cidade: text_field(row, "cidade"),
        endereco: text_field(row, "endereco"),
        latitude: text_field(row, "latitude"),
        longitude: text_field(row, "longitude"),
    }
}

/// Reads every record, remote first with Excel fallback.
pub async fn read_all(store: Option<&RemoteStore>, data_dir: &Path) -> Result<Vec<LedgerEntry>, AppError> {
    if let Some(store) = store {
        let mut entries = Vec::new();
        let mut offset = 0usize;
        let fetched = loop {
            match store
                .select_page(TABLE, "*", Some("created_at.desc"), offset, SCAN_PAGE, &[])
                .await
            {
                Ok(page) => {
                    let n = page.len();
                    entries.extend(page.iter().map(from_remote_row));
                    if n < SCAN_PAGE {
                        break true;
                    }
                    offset += n;
                }
                Err(e) => {
                    log::warn!("Remote ledger read failed, using workbook: {}", e);
                    break false;
                }
            }
        };
        if fetched {
            return Ok(entries);
        }
    }
    read_file(data_dir)
}

/// Highest sequence number visible in the remote table, scanning ids a page
/// at a time. `Ok(None)` means the scan could not run and the caller should
/// fall back to the workbook.
async fn remote_max_number(store: &RemoteStore) -> Option<u64> {
    // A database-side counter function is preferred when the project
    // installed it.
    match store.rpc("get_next_vi_ala_number").await {
        Ok(Value::Number(n)) => {
            if let Some(next) = n.as_u64() {
                log::info!("Next ledger number from database function: {}", next);
                return Some(next.saturating_sub(1));
            }
        }
        Ok(_) => {}
        Err(e) => log::debug!("No ledger counter function, scanning: {}", e),
    }

    let mut max = 0u64;
    let mut offset = 0usize;
    loop {
        let page = match store
            .select_page(TABLE, "vi_ala", None, offset, SCAN_PAGE, &[])
            .await
        {
            Ok(page) => page,
            Err(e) => {
                log::warn!("Remote ledger scan failed: {}", e);
                return None;
            }
        };
        if page.is_empty() {
            return Some(max);
        }
        let fetched = page.len();
        for row in page {
            if let Some(n) = row.get("vi_ala").and_then(Value::as_str).and_then(extract_number) {
                max = max.max(n);
            }
        }
        if fetched < SCAN_PAGE {
            return Some(max);
        }
        offset += fetched;
    }
}

/// Mints the next ledger id. Callers must hold the ledger lock.
pub async fn next_id(store: Option<&RemoteStore>, data_dir: &Path) -> Result<String, AppError> {
    if let Some(store) = store {
        if let Some(max) = remote_max_number(store).await {
            return Ok(format_id(max + 1));
        }
        log::warn!("Falling back to the workbook for the next ledger id");
    }
    let max = read_file(data_dir)?
        .iter()
        .filter_map(|e| extract_number(&e.vi_ala))
        .max()
        .unwrap_or(0);
    Ok(format_id(max + 1))
}

/// Saves a record, remote first with Excel fallback. Callers must hold the
/// ledger lock when the workbook path can be taken.
pub async fn save(
    store: Option<&RemoteStore>,
    data_dir: &Path,
    entry: &LedgerEntry,
) -> Result<(), AppError> {
    if let Some(store) = store {
        match store.insert_batch(TABLE, &[entry.to_remote_row()]).await {
            Ok(()) => {
                log::info!("Ledger record {} saved remotely", entry.vi_ala);
                return Ok(());
            }
            Err(e) => log::warn!("Remote ledger save failed, using workbook: {}", e),
        }
    }
    append_file(data_dir, entry)?;
    log::info!("Ledger record {} saved to workbook", entry.vi_ala);
    Ok(())
}

/// The ten most recent studies, highest sequence number first.
pub async fn recent(
    store: Option<&RemoteStore>,
    data_dir: &Path,
) -> Result<Vec<LedgerSummary>, AppError> {
    let mut summaries: Vec<LedgerSummary> = read_all(store, data_dir)
        .await?
        .iter()
        .map(LedgerEntry::summary)
        .collect();
    summaries.sort_by(|a, b| b.numero.cmp(&a.numero));
    summaries.truncate(RECENT_LIMIT);
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str) -> LedgerEntry {
        LedgerEntry {
            vi_ala: id.to_string(),
            ala: "ALA-9".into(),
            data: "15/01/2024 10:30".into(),
            projetista: "Ana".into(),
            cidade: "Recife".into(),
            endereco: "Rua A, 10".into(),
            latitude: "-8,05".into(),
            longitude: "-34.9".into(),
        }
    }

    #[test]
    fn id_spellings_all_match() {
        assert_eq!(extract_number("VI ALA-0000123"), Some(123));
        assert_eq!(extract_number("vi ala 45"), Some(45));
        assert_eq!(extract_number("VIALA-7"), Some(7));
        assert_eq!(extract_number("VI ALA - 0000008"), Some(8));
        assert_eq!(extract_number("ALA-9"), None);
        assert_eq!(extract_number(""), None);
    }

    #[test]
    fn formatting_pads_to_seven() {
        assert_eq!(format_id(6), "VI ALA-0000006");
        assert_eq!(format_id(1234567), "VI ALA-1234567");
        // Round trip through the matcher.
        assert_eq!(extract_number(&format_id(42)), Some(42));
    }

    #[test]
    fn ensure_creates_headers_only_once() {
        let dir = tempdir().unwrap();
        ensure_file(dir.path()).unwrap();
        assert!(file_path(dir.path()).exists());
        assert_eq!(read_file(dir.path()).unwrap(), Vec::new());
    }

    #[test]
    fn append_then_read_round_trips() {
        let dir = tempdir().unwrap();
        append_file(dir.path(), &entry("VI ALA-0000005")).unwrap();
        append_file(dir.path(), &entry("VI ALA-0000006")).unwrap();

        let entries = read_file(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].vi_ala, "VI ALA-0000006");
        assert_eq!(entries[0].cidade, "Recife");
    }

    #[tokio::test]
    async fn next_id_is_max_plus_one_from_workbook() {
        let dir = tempdir().unwrap();
        append_file(dir.path(), &entry("VI ALA-0000005")).unwrap();
        append_file(dir.path(), &entry("VI ALA-0000002")).unwrap();
        assert_eq!(next_id(None, dir.path()).await.unwrap(), "VI ALA-0000006");
    }

    #[tokio::test]
    async fn next_id_starts_at_one() {
        let dir = tempdir().unwrap();
        assert_eq!(next_id(None, dir.path()).await.unwrap(), "VI ALA-0000001");
    }

    #[test]
    fn remote_row_shape() {
        let row = entry("VI ALA-0000010").to_remote_row();
        assert_eq!(row["vi_ala"], "VI ALA-0000010");
        assert_eq!(row["data"], "2024-01-15");
        assert_eq!(row["latitude"], -8.05);
        assert_eq!(row["longitude"], -34.9);
        let blank = LedgerEntry {
            vi_ala: "VI ALA-1".into(),
            ..Default::default()
        }
        .to_remote_row();
        assert_eq!(blank["ala"], Value::Null);
        assert_eq!(blank["latitude"], Value::Null);
    }

    #[test]
    fn summary_sorting_key() {
        let s = entry("VI ALA-0000123").summary();
        assert_eq!(s.numero, 123);
        assert_eq!(s.numero_ala, "ALA-9");
        assert_eq!(s.data_geracao, "15/01/2024 10:30");
    }

    #[tokio::test]
    async fn recent_sorts_desc_and_limits() {
        let dir = tempdir().unwrap();
        for n in 1..=12 {
            append_file(dir.path(), &entry(&format_id(n))).unwrap();
        }
        let recent = recent(None, dir.path()).await.unwrap();
        assert_eq!(recent.len(), RECENT_LIMIT);
        assert_eq!(recent[0].numero, 12);
        assert_eq!(recent[9].numero, 3);
    }
}
