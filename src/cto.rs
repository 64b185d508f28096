//! CTO dataset: record model, bulk import and export.
//!
//! A CTO is a street fiber termination box with coordinates and port
//! occupancy. The dataset is replaced wholesale on each upload: the remote
//! table is cleared, the upload is streamed in as batched inserts and the
//! file is then promoted to be the current dataset on disk.

use calamine::{Data, Range};
use serde::Serialize;
use serde_json::Value;

use crate::error::{AppError, StoreError};
use crate::normalize;
use crate::remote::RemoteStore;
use crate::xlsx::{self, Cell, SheetWriter};

/// Remote table holding the dataset.
pub const TABLE: &str = "ctos";
/// Remote table recording completed uploads.
pub const HISTORY_TABLE: &str = "upload_history";
/// Rows per insert request during import.
pub const INSERT_BATCH: usize = 2500;
/// Rows per select request during export.
pub const EXPORT_PAGE: usize = 5000;

/// Column headers of the exported workbook, in storage order.
pub const EXPORT_HEADERS: [&str; 16] = [
    "CID_REDE",
    "ESTADO",
    "POP",
    "OLT",
    "SLOT",
    "PON",
    "ID_CTO",
    "CTO",
    "LATITUDE",
    "LONGITUDE",
    "STATUS_CTO",
    "DATA_CADASTRO",
    "PORTAS",
    "OCUPADO",
    "LIVRE",
    "PCT_OCUP",
];

/// One dataset row after normalization.
///
/// Text fields keep whatever the spreadsheet carried; numbers and the
/// registration date are parsed, with `None` for blank or unparseable
/// cells. `data_cadastro` is held as ISO text, which is what both the
/// remote table and the export expect.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CtoRecord {
    pub cid_rede: Option<String>,
    pub estado: Option<String>,
    pub pop: Option<String>,
    pub olt: Option<String>,
    pub slot: Option<String>,
    pub pon: Option<String>,
    pub id_cto: Option<String>,
    pub cto: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub status_cto: Option<String>,
    pub data_cadastro: Option<String>,
    pub portas: Option<i64>,
    pub ocupado: Option<i64>,
    pub livre: Option<i64>,
    pub pct_ocup: Option<f64>,
}

impl CtoRecord {
    /// Builds a record from one spreadsheet row using the header map
    /// produced by [`xlsx::header_map`].
    pub fn from_row(
        columns: &std::collections::HashMap<usize, &'static str>,
        row: &[Data],
    ) -> Self {
        let mut rec = CtoRecord::default();
        for (idx, key) in columns {
            let Some(cell) = row.get(*idx) else { continue };
            match *key {
                "cid_rede" => rec.cid_rede = normalize::parse_string(cell),
                "estado" => rec.estado = normalize::parse_string(cell),
                "pop" => rec.pop = normalize::parse_string(cell),
                "olt" => rec.olt = normalize::parse_string(cell),
                "slot" => rec.slot = normalize::parse_string(cell),
                "pon" => rec.pon = normalize::parse_string(cell),
                "id_cto" => rec.id_cto = normalize::parse_string(cell),
                "cto" => rec.cto = normalize::parse_string(cell),
                "latitude" => rec.latitude = normalize::parse_float(cell),
                "longitude" => rec.longitude = normalize::parse_float(cell),
                "status_cto" => rec.status_cto = normalize::parse_string(cell),
                "data_cadastro" => {
                    rec.data_cadastro = normalize::parse_date(cell)
                        .map(|d| d.format("%Y-%m-%d").to_string())
                }
                "portas" => rec.portas = normalize::parse_int(cell),
                "ocupado" => rec.ocupado = normalize::parse_int(cell),
                "livre" => rec.livre = normalize::parse_int(cell),
                "pct_ocup" => rec.pct_ocup = normalize::parse_float(cell),
                _ => {}
            }
        }
        rec
    }

    /// A row is importable when it carries a plausible coordinate pair.
    /// Everything else about it may be blank.
    pub fn is_importable(&self) -> bool {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => normalize::coords_in_range(lat, lng),
            _ => false,
        }
    }
}

/// Counters reported after an import.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ImportStats {
    pub total_rows: usize,
    pub valid_rows: usize,
    pub invalid_rows: usize,
    pub imported_rows: usize,
}

/// Incremental scan of a parsed sheet.
///
/// Rows are classified on demand, so an import never holds more than one
/// insert batch of records at a time.
pub struct RowScanner<'a> {
    columns: std::collections::HashMap<usize, &'static str>,
    rows: calamine::Rows<'a, Data>,
    stats: ImportStats,
}

impl<'a> RowScanner<'a> {
    /// Reads the header row and prepares the scan.
    pub fn new(range: &'a Range<Data>) -> Result<Self, AppError> {
        let mut rows = range.rows();
        let header_row = rows
            .next()
            .ok_or_else(|| AppError::Spreadsheet("planilha vazia".into()))?;
        let columns = xlsx::header_map(header_row);
        if columns.is_empty() {
            return Err(AppError::Spreadsheet(
                "nenhuma coluna reconhecida no cabeçalho".into(),
            ));
        }
        Ok(RowScanner {
            columns,
            rows,
            stats: ImportStats::default(),
        })
    }

    /// Scans forward and returns the next batch of importable records, at
    /// most `limit` of them. An empty batch means the sheet is exhausted.
    pub fn next_batch(&mut self, limit: usize) -> Vec<CtoRecord> {
        let mut batch = Vec::new();
        for row in self.rows.by_ref() {
            self.stats.total_rows += 1;
            let rec = CtoRecord::from_row(&self.columns, row);
            if rec.is_importable() {
                self.stats.valid_rows += 1;
                batch.push(rec);
                if batch.len() == limit {
                    break;
                }
            } else {
                self.stats.invalid_rows += 1;
            }
        }
        batch
    }

    /// Counters for the rows scanned so far.
    pub fn stats(&self) -> ImportStats {
        self.stats
    }
}

/// Clears the remote table and imports a parsed sheet, recording the upload
/// in the history table. History failures are logged, never fatal.
///
/// A failed batch aborts the import; rows already inserted stay, which the
/// pre-clear makes acceptable.
pub async fn replace_all(
    store: &RemoteStore,
    range: &Range<Data>,
    file_name: &str,
    file_size: u64,
    uploaded_by: &str,
) -> Result<ImportStats, AppError> {
    let mut scanner = RowScanner::new(range)?;
    store.clear_table(TABLE).await?;

    let mut imported = 0usize;
    loop {
        let batch = scanner.next_batch(INSERT_BATCH);
        if batch.is_empty() {
            break;
        }
        store.insert_batch(TABLE, &batch).await?;
        imported += batch.len();
        log::info!("Imported {} CTOs so far", imported);
    }
    let mut stats = scanner.stats();
    stats.imported_rows = imported;

    if stats.imported_rows > 0 {
        let entry = serde_json::json!({
            "file_name": file_name,
            "file_size": file_size,
            "total_rows": stats.total_rows,
            "valid_rows": stats.imported_rows,
            "uploaded_by": uploaded_by,
        });
        if let Err(e) = store.insert_batch(HISTORY_TABLE, &[entry]).await {
            log::warn!("Could not record upload history: {}", e);
        }
    } else {
        log::warn!(
            "No importable CTOs in upload ({} rows, {} invalid)",
            stats.total_rows,
            stats.invalid_rows
        );
    }
    Ok(stats)
}

fn export_cells(row: &Value) -> Vec<Cell> {
    normalize::REQUIRED_COLUMNS
        .iter()
        .map(|key| {
            row.get(*key)
                .map(xlsx::cell_from_json)
                .unwrap_or(Cell::Empty)
        })
        .collect()
}

/// Builds the full dataset workbook from the remote table.
///
/// An empty table yields a headers-only workbook. Any remote failure is
/// returned so the caller can fall back to the file on disk.
pub async fn export_remote(store: &RemoteStore) -> Result<Vec<u8>, AppError> {
    let total = store.count(TABLE).await?;
    if total == 0 {
        return xlsx::empty_workbook_buffer("CTOs", &EXPORT_HEADERS);
    }

    let mut writer = SheetWriter::with_headers("CTOs", &EXPORT_HEADERS)?;
    let mut offset = 0usize;
    loop {
        let page = store
            .select_page(
                TABLE,
                "*",
                Some("created_at.desc"),
                offset,
                EXPORT_PAGE,
                &[],
            )
            .await?;
        if page.is_empty() {
            break;
        }
        let fetched = page.len();
        for row in &page {
            writer.push_row(&export_cells(row))?;
        }
        offset += fetched;
        if fetched < EXPORT_PAGE {
            break;
        }
    }
    log::info!("Exported {} CTOs from Supabase", writer.row_count());
    writer.finish_buffer()
}

/// Default search radius for the nearby query, meters. Generous so the
/// street-route distance the designers care about still fits inside it.
pub const NEARBY_DEFAULT_RADIUS_M: f64 = 350.0;
/// How many nearby CTOs the query returns.
pub const NEARBY_LIMIT: usize = 5;

const EARTH_RADIUS_M: f64 = 6_371_000.0;
/// Meters per degree of latitude, close enough for a bounding box.
const METERS_PER_DEGREE: f64 = 111_000.0;

/// Great-circle distance between two coordinates, in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// One active CTO near a prospect address.
#[derive(Debug, Serialize)]
pub struct NearbyCto {
    pub nome: String,
    pub latitude: f64,
    pub longitude: f64,
    pub vagas_total: i64,
    pub clientes_conectados: i64,
    pub pct_ocup: f64,
    pub cidade: String,
    pub pop: String,
    pub id: String,
    pub distancia_metros: f64,
}

fn nearby_from_row(row: &Value, lat: f64, lng: f64) -> Option<NearbyCto> {
    let row_lat = row.get("latitude").and_then(Value::as_f64)?;
    let row_lng = row.get("longitude").and_then(Value::as_f64)?;
    let text = |key: &str| {
        row.get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };
    let distance = haversine_m(lat, lng, row_lat, row_lng);
    let nome = match row.get("cto").and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => text("id_cto"),
    };
    Some(NearbyCto {
        nome,
        latitude: row_lat,
        longitude: row_lng,
        vagas_total: row.get("portas").and_then(Value::as_i64).unwrap_or(0),
        clientes_conectados: row.get("ocupado").and_then(Value::as_i64).unwrap_or(0),
        pct_ocup: row.get("pct_ocup").and_then(Value::as_f64).unwrap_or(0.0),
        cidade: text("cid_rede"),
        pop: text("pop"),
        id: text("id_cto"),
        distancia_metros: (distance * 100.0).round() / 100.0,
    })
}

/// Active CTOs within `radius_m` meters of a point, nearest first, at most
/// [`NEARBY_LIMIT`] results.
///
/// The remote query pre-filters with a bounding box so the table index does
/// the heavy lifting; the exact geodesic distance then trims the corners.
pub async fn nearby(
    store: &RemoteStore,
    lat: f64,
    lng: f64,
    radius_m: f64,
) -> Result<Vec<NearbyCto>, AppError> {
    let degrees = radius_m / METERS_PER_DEGREE;
    let filters = vec![
        ("latitude", format!("gte.{}", lat - degrees)),
        ("latitude", format!("lte.{}", lat + degrees)),
        ("longitude", format!("gte.{}", lng - degrees)),
        ("longitude", format!("lte.{}", lng + degrees)),
        ("status_cto", "ilike.ATIVA".to_string()),
    ];
    let rows = store
        .select_page(TABLE, "*", None, 0, SCAN_BOX_LIMIT, &filters)
        .await?;

    let mut found: Vec<NearbyCto> = rows
        .iter()
        .filter_map(|row| nearby_from_row(row, lat, lng))
        .filter(|cto| cto.distancia_metros <= radius_m)
        .collect();
    found.sort_by(|a, b| {
        a.distancia_metros
            .partial_cmp(&b.distancia_metros)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    found.truncate(NEARBY_LIMIT);
    Ok(found)
}

/// Upper bound on rows pulled for one bounding box.
const SCAN_BOX_LIMIT: usize = 10_000;

/// Latest upload timestamp recorded in the history table, ISO text.
pub async fn last_upload_time(store: &RemoteStore) -> Result<Option<String>, StoreError> {
    let row = store
        .select_page(
            HISTORY_TABLE,
            "uploaded_at",
            Some("uploaded_at.desc"),
            0,
            1,
            &[],
        )
        .await?
        .into_iter()
        .next();
    Ok(row
        .and_then(|r| r.get("uploaded_at").and_then(Value::as_str).map(str::to_string)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::REQUIRED_COLUMNS;
    use std::collections::HashMap;

    fn full_columns() -> HashMap<usize, &'static str> {
        REQUIRED_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, k)| (i, *k))
            .collect()
    }

    fn row(lat: &str, lng: &str) -> Vec<Data> {
        let mut cells = vec![Data::String("x".into()); 16];
        cells[8] = Data::String(lat.into());
        cells[9] = Data::String(lng.into());
        cells[12] = Data::Float(16.0);
        cells[13] = Data::Float(9.0);
        cells[14] = Data::Float(7.0);
        cells[15] = Data::String("56,25".into());
        cells
    }

    #[test]
    fn record_parses_comma_coordinates() {
        let rec = CtoRecord::from_row(&full_columns(), &row("-23,5505", "-46,6333"));
        assert_eq!(rec.latitude, Some(-23.5505));
        assert_eq!(rec.longitude, Some(-46.6333));
        assert_eq!(rec.portas, Some(16));
        assert_eq!(rec.pct_ocup, Some(56.25));
        assert!(rec.is_importable());
    }

    #[test]
    fn out_of_range_coordinates_are_invalid() {
        assert!(!CtoRecord::from_row(&full_columns(), &row("91", "0")).is_importable());
        assert!(!CtoRecord::from_row(&full_columns(), &row("0", "-181")).is_importable());
        assert!(!CtoRecord::from_row(&full_columns(), &row("", "10")).is_importable());
    }

    #[test]
    fn serial_date_becomes_iso() {
        let mut cells = row("-10", "-50");
        cells[11] = Data::Float(45306.0);
        let rec = CtoRecord::from_row(&full_columns(), &cells);
        assert_eq!(rec.data_cadastro.as_deref(), Some("2024-01-15"));
    }

    fn range_of(body: Vec<Vec<Data>>) -> Range<Data> {
        let mut grid: Vec<Vec<Data>> = Vec::new();
        grid.push(
            REQUIRED_COLUMNS
                .iter()
                .map(|k| Data::String(k.to_string()))
                .collect(),
        );
        grid.extend(body);
        Range::from_sparse(
            grid.iter()
                .enumerate()
                .flat_map(|(r, cells)| {
                    cells
                        .iter()
                        .enumerate()
                        .map(move |(c, cell)| ((r as u32, c as u32), cell.clone()))
                })
                .map(|((r, c), v)| calamine::Cell::new((r, c), v))
                .collect(),
        )
    }

    #[test]
    fn stats_partition_the_rows() {
        let range = range_of(vec![
            row("-23,5", "-46,6"),
            row("95", "-46,6"),
            row("-8,05", "-34,9"),
        ]);

        let mut scanner = RowScanner::new(&range).unwrap();
        let records = scanner.next_batch(usize::MAX);
        let stats = scanner.stats();
        assert_eq!(stats.total_rows, 3);
        assert_eq!(stats.valid_rows, 2);
        assert_eq!(stats.invalid_rows, 1);
        assert_eq!(stats.total_rows, stats.valid_rows + stats.invalid_rows);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn scanner_batches_never_exceed_the_limit() {
        let mut body = Vec::new();
        for i in 0..5 {
            body.push(row("-8,05", "-34,9"));
            if i % 2 == 0 {
                body.push(row("", ""));
            }
        }
        let range = range_of(body);

        let mut scanner = RowScanner::new(&range).unwrap();
        let mut collected = 0;
        loop {
            let batch = scanner.next_batch(2);
            if batch.is_empty() {
                break;
            }
            assert!(batch.len() <= 2);
            collected += batch.len();
        }
        assert_eq!(collected, 5);
        let stats = scanner.stats();
        assert_eq!(stats.valid_rows, 5);
        assert_eq!(stats.invalid_rows, 3);
    }

    #[test]
    fn haversine_known_distance() {
        // Praça da Sé to Paulista, roughly 3.3 km.
        let d = haversine_m(-23.5505, -46.6333, -23.5614, -46.6559);
        assert!((2500.0..4500.0).contains(&d), "got {}", d);
        assert_eq!(haversine_m(-8.05, -34.9, -8.05, -34.9), 0.0);
    }

    #[test]
    fn nearby_row_mapping_and_distance() {
        let row = serde_json::json!({
            "cto": "CTO-A",
            "id_cto": "ID-1",
            "latitude": -8.0500,
            "longitude": -34.9000,
            "portas": 16,
            "ocupado": 9,
            "pct_ocup": 56.25,
            "cid_rede": "Recife",
            "pop": "POP-RE",
        });
        let cto = nearby_from_row(&row, -8.0505, -34.9000).unwrap();
        assert_eq!(cto.nome, "CTO-A");
        assert_eq!(cto.id, "ID-1");
        assert_eq!(cto.vagas_total, 16);
        // About 55 meters of latitude offset.
        assert!((40.0..80.0).contains(&cto.distancia_metros));

        let no_coords = serde_json::json!({"cto": "x"});
        assert!(nearby_from_row(&no_coords, 0.0, 0.0).is_none());
    }

    #[test]
    fn export_cells_follow_storage_order() {
        let row = serde_json::json!({
            "cto": "CTO-1",
            "latitude": -23.5,
            "longitude": -46.6,
            "portas": 16,
        });
        let cells = export_cells(&row);
        assert_eq!(cells.len(), 16);
        assert!(matches!(&cells[7], Cell::Text(s) if s == "CTO-1"));
        assert!(matches!(cells[8], Cell::Number(n) if n == -23.5));
        assert!(matches!(cells[0], Cell::Empty));
    }
}
