//! Designer (projetista) accounts.
//!
//! Accounts live in the `projetistas` table with an Excel mirror at
//! `projetistas.xlsx`. Reads prefer the remote table and silently fall back
//! to the file; writes go to whichever side is reachable, remote first.
//!
//! Credential checks go through [`PasswordScheme`] so the storage format
//! can change without touching the handlers. The deployed scheme is
//! [`PlaintextScheme`], matching what the table currently holds.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, StoreError};
use crate::locks::{self, LockManager};
use crate::remote::{RemoteStore, SCAN_PAGE};
use crate::xlsx::{self, Cell, SheetWriter};

/// Remote table name.
pub const TABLE: &str = "projetistas";
/// File name of the Excel mirror inside the data directory.
pub const FILE_NAME: &str = "projetistas.xlsx";

const HEADERS: [&str; 2] = ["nome", "senha"];

/// One designer account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Designer {
    pub nome: String,
    pub senha: String,
}

/// How stored credentials are compared against a login attempt.
pub trait PasswordScheme: Send + Sync {
    /// Whether `given` matches the `stored` credential.
    fn verify(&self, stored: &str, given: &str) -> bool;
    /// Prepares a new password for storage.
    fn protect(&self, plain: &str) -> String;
}

/// Direct comparison, credentials stored as typed.
pub struct PlaintextScheme;

impl PasswordScheme for PlaintextScheme {
    fn verify(&self, stored: &str, given: &str) -> bool {
        stored == given
    }

    fn protect(&self, plain: &str) -> String {
        plain.to_string()
    }
}

/// Path of the Excel mirror.
pub fn file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FILE_NAME)
}

/// Reads every account from the Excel mirror. A missing file is an empty
/// roster, not an error.
pub fn read_file(data_dir: &Path) -> Result<Vec<Designer>, AppError> {
    let path = file_path(data_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let range = xlsx::open_first_sheet(&path)?;
    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Vec::new());
    };

    // Locate the two columns by name, case-insensitive.
    let mut nome_col = None;
    let mut senha_col = None;
    for (idx, cell) in header_row.iter().enumerate() {
        if let Some(text) = crate::normalize::parse_string(cell) {
            match text.to_lowercase().as_str() {
                "nome" => nome_col = Some(idx),
                "senha" => senha_col = Some(idx),
                _ => {}
            }
        }
    }
    let (nome_col, senha_col) = match (nome_col, senha_col) {
        (Some(n), Some(s)) => (n, s),
        _ => {
            return Err(AppError::Spreadsheet(format!(
                "{} não possui colunas nome/senha",
                FILE_NAME
            )))
        }
    };

    let mut designers = Vec::new();
    for row in rows {
        let nome = row.get(nome_col).and_then(crate::normalize::parse_string);
        let senha = row.get(senha_col).and_then(crate::normalize::parse_string);
        if let (Some(nome), Some(senha)) = (nome, senha) {
            designers.push(Designer { nome, senha });
        }
    }
    Ok(designers)
}

/// Rewrites the Excel mirror with the given roster, sorted by name.
/// Callers must hold the designers lock.
pub fn write_file(data_dir: &Path, designers: &[Designer]) -> Result<(), AppError> {
    let mut roster: Vec<&Designer> = designers.iter().collect();
    roster.sort_by(|a, b| a.nome.to_lowercase().cmp(&b.nome.to_lowercase()));

    let mut writer = SheetWriter::with_headers("Projetistas", &HEADERS)?;
    for designer in roster {
        writer.push_row(&[
            Cell::Text(designer.nome.clone()),
            Cell::Text(designer.senha.clone()),
        ])?;
    }
    writer.finish_file(&file_path(data_dir))
}

/// Converts a remote row to a `Designer`, skipping malformed rows.
pub fn from_remote_row(row: &Value) -> Option<Designer> {
    let nome = row.get("nome")?.as_str()?.trim();
    let senha = row.get("senha").and_then(Value::as_str).unwrap_or("");
    if nome.is_empty() {
        return None;
    }
    Some(Designer {
        nome: nome.to_string(),
        senha: senha.to_string(),
    })
}

/// Reads the roster, remote first with file fallback.
pub async fn read_all(
    store: Option<&RemoteStore>,
    data_dir: &Path,
) -> Result<Vec<Designer>, AppError> {
    if let Some(store) = store {
        match store
            .select_page(TABLE, "nome,senha", Some("nome.asc"), 0, SCAN_PAGE, &[])
            .await
        {
            Ok(rows) => return Ok(rows.iter().filter_map(from_remote_row).collect()),
            Err(e) => log::warn!("Remote roster read failed, using file: {}", e),
        }
    }
    read_file(data_dir)
}

fn ilike(nome: &str) -> Vec<crate::remote::Filter> {
    vec![("nome", format!("ilike.{}", nome.trim()))]
}

/// Adds an account. `AppError::Conflict` when the name is taken.
pub async fn add(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
    nome: &str,
    senha: &str,
) -> Result<(), AppError> {
    if let Some(store) = store {
        let attempt = async {
            if store.select_one(TABLE, "nome", &ilike(nome)).await?.is_some() {
                return Ok(Some(AppError::Conflict("Projetista já existe".into())));
            }
            let row = serde_json::json!({ "nome": nome, "senha": senha });
            store.insert_batch(TABLE, &[row]).await?;
            Ok::<_, StoreError>(None)
        };
        match attempt.await {
            Ok(Some(conflict)) => return Err(conflict),
            Ok(None) => {
                log::info!("Designer '{}' added remotely", nome);
                return Ok(());
            }
            Err(e) => log::warn!("Remote designer add failed, using file: {}", e),
        }
    }

    let dir = data_dir.to_path_buf();
    let nome = nome.to_string();
    let senha = senha.to_string();
    locks
        .with_lock(locks::DESIGNERS, async move {
            let mut roster = read_file(&dir)?;
            if find(&roster, &nome).is_some() {
                return Err(AppError::Conflict("Projetista já existe".into()));
            }
            roster.push(Designer { nome, senha });
            write_file(&dir, &roster)
        })
        .await
}

/// Removes an account. Returns false when the name was not on the roster.
pub async fn remove(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
    nome: &str,
) -> Result<bool, AppError> {
    if let Some(store) = store {
        let attempt = async {
            if store.select_one(TABLE, "nome", &ilike(nome)).await?.is_none() {
                return Ok(false);
            }
            store.delete_where(TABLE, &ilike(nome)).await?;
            Ok::<_, StoreError>(true)
        };
        match attempt.await {
            Ok(removed) => {
                if removed {
                    log::info!("Designer '{}' removed remotely", nome);
                }
                return Ok(removed);
            }
            Err(e) => log::warn!("Remote designer removal failed, using file: {}", e),
        }
    }

    let dir = data_dir.to_path_buf();
    let nome = nome.to_string();
    locks
        .with_lock(locks::DESIGNERS, async move {
            let mut roster = read_file(&dir)?;
            let before = roster.len();
            let wanted = nome.trim().to_lowercase();
            roster.retain(|d| d.nome.to_lowercase() != wanted);
            if roster.len() == before {
                return Ok(false);
            }
            write_file(&dir, &roster)?;
            Ok(true)
        })
        .await
}

/// Changes an account's password. `AppError::NotFound` for unknown names.
pub async fn set_password(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
    scheme: &dyn PasswordScheme,
    nome: &str,
    senha: &str,
) -> Result<(), AppError> {
    let stored = scheme.protect(senha);

    if let Some(store) = store {
        let attempt = async {
            let Some(row) = store.select_one(TABLE, "id,nome", &ilike(nome)).await? else {
                return Ok(false);
            };
            let id = row.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let patch = serde_json::json!({ "senha": stored });
            store
                .update_where(TABLE, &patch, &[("id", format!("eq.{}", id))])
                .await?;
            Ok::<_, StoreError>(true)
        };
        match attempt.await {
            Ok(true) => return Ok(()),
            Ok(false) => return Err(AppError::NotFound("Projetista não encontrado".into())),
            Err(e) => log::warn!("Remote password update failed, using file: {}", e),
        }
    }

    let dir = data_dir.to_path_buf();
    let nome = nome.to_string();
    locks
        .with_lock(locks::DESIGNERS, async move {
            let mut roster = read_file(&dir)?;
            let wanted = nome.trim().to_lowercase();
            let Some(entry) = roster.iter_mut().find(|d| d.nome.to_lowercase() == wanted) else {
                return Err(AppError::NotFound("Projetista não encontrado".into()));
            };
            entry.senha = stored;
            write_file(&dir, &roster)
        })
        .await
}

/// Renames an account. Conflicts when the new name belongs to someone else;
/// the caller is responsible for carrying any live session over.
pub async fn rename(
    store: Option<&RemoteStore>,
    locks: &LockManager,
    data_dir: &Path,
    nome: &str,
    novo_nome: &str,
) -> Result<(), AppError> {
    if let Some(store) = store {
        let attempt = async {
            if let Some(taken) = store.select_one(TABLE, "nome", &ilike(novo_nome)).await? {
                let holder = taken.get("nome").and_then(Value::as_str).unwrap_or_default();
                if holder.to_lowercase() != nome.trim().to_lowercase() {
                    return Ok(Some(AppError::Validation(
                        "Este nome já está em uso por outro usuário".into(),
                    )));
                }
            }
            let Some(row) = store.select_one(TABLE, "id,nome", &ilike(nome)).await? else {
                return Ok(Some(AppError::NotFound("Projetista não encontrado".into())));
            };
            let id = row.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            let patch = serde_json::json!({ "nome": novo_nome });
            store
                .update_where(TABLE, &patch, &[("id", format!("eq.{}", id))])
                .await?;
            Ok::<_, StoreError>(None)
        };
        match attempt.await {
            Ok(Some(err)) => return Err(err),
            Ok(None) => return Ok(()),
            Err(e) => log::warn!("Remote rename failed, using file: {}", e),
        }
    }

    let dir = data_dir.to_path_buf();
    let nome = nome.to_string();
    let novo = novo_nome.to_string();
    locks
        .with_lock(locks::DESIGNERS, async move {
            let mut roster = read_file(&dir)?;
            let old_key = nome.trim().to_lowercase();
            let new_key = novo.trim().to_lowercase();
            if roster
                .iter()
                .any(|d| d.nome.to_lowercase() == new_key && d.nome.to_lowercase() != old_key)
            {
                return Err(AppError::Validation(
                    "Este nome já está em uso por outro usuário".into(),
                ));
            }
            let Some(entry) = roster.iter_mut().find(|d| d.nome.to_lowercase() == old_key)
            else {
                return Err(AppError::NotFound("Projetista não encontrado".into()));
            };
            entry.nome = novo;
            write_file(&dir, &roster)
        })
        .await
}

/// Validates a login attempt. A wrong name and a wrong password are the
/// same `false`, the caller never learns which.
pub async fn authenticate(
    store: Option<&RemoteStore>,
    data_dir: &Path,
    scheme: &dyn PasswordScheme,
    usuario: &str,
    senha: &str,
) -> Result<bool, AppError> {
    if let Some(store) = store {
        match store.select_one(TABLE, "nome,senha", &ilike(usuario)).await {
            Ok(Some(row)) => {
                return Ok(from_remote_row(&row)
                    .map(|d| scheme.verify(&d.senha, senha))
                    .unwrap_or(false));
            }
            Ok(None) => return Ok(false),
            Err(e) => log::warn!("Remote login check failed, using file: {}", e),
        }
    }
    let roster = read_file(data_dir)?;
    Ok(find(&roster, usuario)
        .map(|d| scheme.verify(&d.senha, senha))
        .unwrap_or(false))
}

/// Case-insensitive roster lookup.
pub fn find<'a>(designers: &'a [Designer], nome: &str) -> Option<&'a Designer> {
    let wanted = nome.trim().to_lowercase();
    designers.iter().find(|d| d.nome.to_lowercase() == wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn roster() -> Vec<Designer> {
        vec![
            Designer { nome: "Carla".into(), senha: "s1".into() },
            Designer { nome: "ana".into(), senha: "s2".into() },
            Designer { nome: "Bruno".into(), senha: "s3".into() },
        ]
    }

    #[test]
    fn missing_file_is_empty_roster() {
        let dir = tempdir().unwrap();
        assert_eq!(read_file(dir.path()).unwrap(), Vec::new());
    }

    #[test]
    fn write_then_read_round_trips_sorted() {
        let dir = tempdir().unwrap();
        write_file(dir.path(), &roster()).unwrap();
        let read = read_file(dir.path()).unwrap();
        let names: Vec<&str> = read.iter().map(|d| d.nome.as_str()).collect();
        assert_eq!(names, vec!["ana", "Bruno", "Carla"]);
        assert_eq!(read[0].senha, "s2");
    }

    #[test]
    fn find_is_case_insensitive() {
        let designers = roster();
        assert!(find(&designers, "ANA").is_some());
        assert!(find(&designers, "  bruno ").is_some());
        assert!(find(&designers, "dora").is_none());
    }

    #[test]
    fn plaintext_scheme_compares_directly() {
        let scheme = PlaintextScheme;
        assert!(scheme.verify("abc", "abc"));
        assert!(!scheme.verify("abc", "abd"));
        assert_eq!(scheme.protect("abc"), "abc");
    }

    #[test]
    fn remote_rows_convert() {
        let row = serde_json::json!({"nome": " Ana ", "senha": "x", "id": "u-1"});
        let d = from_remote_row(&row).unwrap();
        assert_eq!(d.nome, "Ana");
        let bad = serde_json::json!({"senha": "x"});
        assert!(from_remote_row(&bad).is_none());
    }
}
