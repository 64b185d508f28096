//! Pure conversion helpers for raw spreadsheet cells.
//!
//! The dataset files come from field teams and are messy: headers carry
//! accents and spaces, coordinates use comma decimals, dates arrive as text
//! in several formats or as Excel serial numbers. Everything here is a pure
//! function so the import pipeline stays easy to test.

use calamine::Data;
use chrono::{Duration, NaiveDate};

/// The sixteen canonical dataset columns, in storage order.
pub const REQUIRED_COLUMNS: [&str; 16] = [
    "cid_rede",
    "estado",
    "pop",
    "olt",
    "slot",
    "pon",
    "id_cto",
    "cto",
    "latitude",
    "longitude",
    "status_cto",
    "data_cadastro",
    "portas",
    "ocupado",
    "livre",
    "pct_ocup",
];

/// Maps a raw header cell to its canonical column key.
///
/// Matching is case-insensitive, trims whitespace and accepts the common
/// aliases seen in field spreadsheets (`lat`, `long`, `cid rede`, ...).
/// Returns `None` for headers that are not part of the dataset.
pub fn normalize_key(raw: &str) -> Option<&'static str> {
    let key = raw.trim().to_lowercase();
    let canon = match key.as_str() {
        "cid_rede" | "cid rede" | "cidrede" | "cidade" => "cid_rede",
        "estado" | "uf" => "estado",
        "pop" => "pop",
        "olt" => "olt",
        "slot" => "slot",
        "pon" => "pon",
        "id_cto" | "id cto" | "idcto" => "id_cto",
        "cto" => "cto",
        "latitude" | "lat" => "latitude",
        "longitude" | "long" | "lng" | "lon" => "longitude",
        "status_cto" | "status cto" | "status" => "status_cto",
        "data_cadastro" | "data cadastro" | "data" => "data_cadastro",
        "portas" => "portas",
        "ocupado" | "ocupados" => "ocupado",
        "livre" | "livres" => "livre",
        "pct_ocup" | "pct ocup" | "% ocup" | "%ocup" | "pct_ocupacao" => "pct_ocup",
        _ => return None,
    };
    Some(canon)
}

/// Extracts a trimmed string from any cell type; empty cells give `None`.
pub fn parse_string(cell: &Data) -> Option<String> {
    let text = match cell {
        Data::Empty => return None,
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => {
            // Integral floats print without the trailing ".0".
            if f.fract() == 0.0 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.as_f64().to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Error(_) => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Parses a float, accepting Brazilian comma decimals in text cells.
pub fn parse_float(cell: &Data) -> Option<f64> {
    match cell {
        Data::Float(f) => Some(*f),
        Data::Int(i) => Some(*i as f64),
        Data::DateTime(dt) => Some(dt.as_f64()),
        Data::String(s) => {
            let cleaned = s.trim().replace(',', ".");
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Parses an integer, truncating floats and numeric text.
pub fn parse_int(cell: &Data) -> Option<i64> {
    match cell {
        Data::Int(i) => Some(*i),
        Data::Float(f) => Some(*f as i64),
        Data::String(s) => {
            let cleaned = s.trim().replace(',', ".");
            cleaned
                .parse::<i64>()
                .ok()
                .or_else(|| cleaned.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Reference date for Excel serial numbers (the 1900 system, with its
/// historical off-by-two: serial 1 is 1899-12-31 and 60 is the phantom
/// 1900-02-29, so day counting starts at 1899-12-30).
fn excel_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1899, 12, 30).unwrap()
}

/// Converts an Excel serial day number to a calendar date.
pub fn date_from_serial(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || serial < 1.0 || serial > 2_958_465.0 {
        return None;
    }
    excel_epoch().checked_add_signed(Duration::days(serial.trunc() as i64))
}

/// Parses a registration date from a cell.
///
/// Accepts serial numbers, ISO text (`YYYY-MM-DD`, with or without a time
/// suffix) and Brazilian `DD/MM/YYYY` text.
pub fn parse_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => date_from_serial(dt.as_f64()),
        Data::Float(f) => date_from_serial(*f),
        Data::Int(i) => date_from_serial(*i as f64),
        Data::String(s) | Data::DateTimeIso(s) => parse_date_text(s),
        _ => None,
    }
}

/// Parses date text in the formats the portal accepts.
pub fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    // ISO first, optionally followed by a time component.
    let head = text.split(&[' ', 'T'][..]).next().unwrap_or(text);
    if let Ok(d) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(head, "%d/%m/%Y") {
        return Some(d);
    }
    // Pure digits may be a serial number stored as text.
    if let Ok(serial) = text.replace(',', ".").parse::<f64>() {
        return date_from_serial(serial);
    }
    None
}

/// Converts `DD/MM/YYYY` text to ISO `YYYY-MM-DD`, passing ISO through.
pub fn to_iso_date(raw: &str) -> Option<String> {
    parse_date_text(raw).map(|d| d.format("%Y-%m-%d").to_string())
}

/// Converts ISO text to display form `DD/MM/YYYY`, passing it through when
/// it is not a recognizable date.
pub fn to_display_date(raw: &str) -> String {
    parse_date_text(raw)
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Whether a latitude/longitude pair is geographically plausible.
pub fn coords_in_range(lat: f64, lng: f64) -> bool {
    (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_aliases_resolve() {
        assert_eq!(normalize_key("  LAT "), Some("latitude"));
        assert_eq!(normalize_key("Long"), Some("longitude"));
        assert_eq!(normalize_key("CID REDE"), Some("cid_rede"));
        assert_eq!(normalize_key("% Ocup"), Some("pct_ocup"));
        assert_eq!(normalize_key("Status CTO"), Some("status_cto"));
        assert_eq!(normalize_key("observacao"), None);
    }

    #[test]
    fn comma_decimals_parse() {
        assert_eq!(parse_float(&Data::String("-23,5505".into())), Some(-23.5505));
        assert_eq!(parse_float(&Data::Float(10.25)), Some(10.25));
        assert_eq!(parse_float(&Data::String("abc".into())), None);
    }

    #[test]
    fn int_from_float_and_text() {
        assert_eq!(parse_int(&Data::Float(16.0)), Some(16));
        assert_eq!(parse_int(&Data::String(" 8 ".into())), Some(8));
        assert_eq!(parse_int(&Data::String("7,0".into())), Some(7));
        assert_eq!(parse_int(&Data::Empty), None);
    }

    #[test]
    fn serial_dates_convert() {
        // 2024-01-15 is serial 45306 in the 1900 date system.
        assert_eq!(
            date_from_serial(45306.0),
            NaiveDate::from_ymd_opt(2024, 1, 15)
        );
        assert_eq!(date_from_serial(0.0), None);
        assert_eq!(date_from_serial(-5.0), None);
    }

    #[test]
    fn date_text_formats() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7);
        assert_eq!(parse_date_text("2024-03-07"), d);
        assert_eq!(parse_date_text("2024-03-07 10:30:00"), d);
        assert_eq!(parse_date_text("07/03/2024"), d);
        assert_eq!(parse_date_text("45306"), NaiveDate::from_ymd_opt(2024, 1, 15));
        assert_eq!(parse_date_text("not a date"), None);
    }

    #[test]
    fn date_conversions_round() {
        assert_eq!(to_iso_date("07/03/2024").as_deref(), Some("2024-03-07"));
        assert_eq!(to_display_date("2024-03-07"), "07/03/2024");
        assert_eq!(to_display_date("???"), "???");
    }

    #[test]
    fn coordinate_bounds() {
        assert!(coords_in_range(-23.55, -46.63));
        assert!(coords_in_range(90.0, 180.0));
        assert!(!coords_in_range(91.0, 0.0));
        assert!(!coords_in_range(0.0, -180.5));
    }

    #[test]
    fn string_cells_trim_and_coerce() {
        assert_eq!(parse_string(&Data::String("  CTO-123  ".into())), Some("CTO-123".into()));
        assert_eq!(parse_string(&Data::Float(42.0)), Some("42".into()));
        assert_eq!(parse_string(&Data::String("   ".into())), None);
        assert_eq!(parse_string(&Data::Empty), None);
    }
}
