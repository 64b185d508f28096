//! Tabulation labels, the viability verdicts designers attach to studies.
//!
//! Same remote-first-with-Excel-mirror arrangement as the designer roster,
//! plus a seeding rule: a missing mirror file is created with the five
//! standard labels so a fresh install is usable offline.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{AppError, StoreError};
use crate::locks::{self, LockManager};
use crate::remote::{RemoteStore, SCAN_PAGE};
use crate::xlsx::{self, Cell, SheetWriter};

/// Remote table name.
pub const TABLE: &str = "tabulacoes";
/// File name of the Excel mirror inside the data directory.
pub const FILE_NAME: &str = "tabulacoes.xlsx";

/// Labels a fresh install starts with.
pub const DEFAULT_LABELS: [&str; 5] = [
    "Aprovado Com Portas",
    "Aprovado Com Alívio de Rede/Cleanup",
    "Aprovado Prédio Não Cabeado",
    "Aprovado - Endereço não Localizado",
    "Fora da Área de Cobertura",
];

const HEADERS: [&str; 1] = ["nome"];

/// Path of the Excel mirror.
pub fn file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FILE_NAME)
}

/// Reads the labels from the mirror, seeding it with the defaults when the
/// file does not exist yet. Callers must hold the tabulations lock, since
/// seeding writes the file.
pub fn read_or_seed_file(data_dir: &Path) -> Result<Vec<String>, AppError> {
    let path = file_path(data_dir);
    if !path.exists() {
        let defaults: Vec<String> = DEFAULT_LABELS.iter().map(|s| s.to_string()).collect();
        write_file(data_dir, &defaults)?;
        log::info!("Seeded {} with the default labels", FILE_NAME);
        return Ok(defaults);
    }

    let range = xlsx::open_first_sheet(&path)?;
    let labels = range
        .rows()
        .skip(1)
        .filter_map(|row| row.first().and_then(crate::normalize::parse_string))
        .collect();
    Ok(labels)
}

/// Rewrites the mirror. Callers must hold the tabulations lock.
pub fn write_file(data_dir: &Path, labels: &[String]) -> Result<(), AppError> {
    let mut writer = SheetWriter::with_headers("Tabulações", &HEADERS)?;
    for label in labels {
        writer.push_row(&[Cell::Text(label.clone())])?;
    }
    writer.finish_file(&file_path(data_dir))
}

/// Extracts the label from a remote row.
pub fn from_remote_row(row: &Value) -> Option<String> {
    let nome = row.get("nome")?.as_str()?.trim();
    if nome.is_empty() {
        None
    } else {
        Some(nome.to_string())
    }
}

/// Reads the labels, remote first with seeded file fallback.
pub async fn read_all(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
) -> Result<Vec<String>, AppError> {
    if let Some(store) = store {
        match store
            .select_page(TABLE, "nome", Some("nome.asc"), 0, SCAN_PAGE, &[])
            .await
        {
            Ok(rows) => return Ok(rows.iter().filter_map(from_remote_row).collect()),
            Err(e) => log::warn!("Remote label read failed, using file: {}", e),
        }
    }
    let dir = data_dir.to_path_buf();
    locks
        .with_lock(locks::TABULATIONS, async move { read_or_seed_file(&dir) })
        .await
}

/// Adds a label. `AppError::Conflict` when it already exists.
pub async fn add(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
    nome: &str,
) -> Result<(), AppError> {
    let nome = nome.trim();
    if let Some(store) = store {
        let filter = vec![("nome", format!("ilike.{}", nome))];
        let attempt = async {
            if store.select_one(TABLE, "nome", &filter).await?.is_some() {
                return Ok(Some(AppError::Conflict("Tabulação já existe".into())));
            }
            store
                .insert_batch(TABLE, &[serde_json::json!({ "nome": nome })])
                .await?;
            Ok::<_, StoreError>(None)
        };
        match attempt.await {
            Ok(Some(conflict)) => return Err(conflict),
            Ok(None) => return Ok(()),
            Err(e) => log::warn!("Remote label add failed, using file: {}", e),
        }
    }

    let dir = data_dir.to_path_buf();
    let nome = nome.to_string();
    locks
        .with_lock(locks::TABULATIONS, async move {
            let mut labels = read_or_seed_file(&dir)?;
            if contains(&labels, &nome) {
                return Err(AppError::Conflict("Tabulação já existe".into()));
            }
            labels.push(nome);
            write_file(&dir, &labels)
        })
        .await
}

/// Removes a label. Returns false when it was not present.
pub async fn remove(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
    nome: &str,
) -> Result<bool, AppError> {
    let nome = nome.trim();
    if let Some(store) = store {
        let filter = vec![("nome", format!("ilike.{}", nome))];
        let attempt = async {
            if store.select_one(TABLE, "nome", &filter).await?.is_none() {
                return Ok(false);
            }
            store.delete_where(TABLE, &filter).await?;
            Ok::<_, StoreError>(true)
        };
        match attempt.await {
            Ok(removed) => return Ok(removed),
            Err(e) => log::warn!("Remote label removal failed, using file: {}", e),
        }
    }

    let dir = data_dir.to_path_buf();
    let nome = nome.to_string();
    locks
        .with_lock(locks::TABULATIONS, async move {
            let mut labels = read_or_seed_file(&dir)?;
            let before = labels.len();
            let wanted = nome.to_lowercase();
            labels.retain(|l| l.to_lowercase() != wanted);
            if labels.len() == before {
                return Ok(false);
            }
            write_file(&dir, &labels)?;
            Ok(true)
        })
        .await
}

/// Case-insensitive membership test.
pub fn contains(labels: &[String], nome: &str) -> bool {
    let wanted = nome.trim().to_lowercase();
    labels.iter().any(|l| l.to_lowercase() == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_seeds_defaults() {
        let dir = tempdir().unwrap();
        let labels = read_or_seed_file(dir.path()).unwrap();
        assert_eq!(labels.len(), 5);
        assert!(contains(&labels, "aprovado com portas"));
        // The file now exists and re-reading gives the same set.
        assert!(file_path(dir.path()).exists());
        assert_eq!(read_or_seed_file(dir.path()).unwrap(), labels);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let labels = vec!["Um".to_string(), "Dois".to_string()];
        write_file(dir.path(), &labels).unwrap();
        assert_eq!(read_or_seed_file(dir.path()).unwrap(), labels);
    }

    #[test]
    fn membership_ignores_case_and_spacing() {
        let labels = vec!["Fora da Área de Cobertura".to_string()];
        assert!(contains(&labels, "  fora da área de cobertura "));
        assert!(!contains(&labels, "Aprovado"));
    }
}
