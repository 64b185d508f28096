//! HTTP surface: routes, handlers and the background tasks.
//!
//! Every response is a JSON envelope with a `success` flag; errors go
//! through [`AppError`] which renders the same envelope with an `error`
//! message. The dataset upload answers immediately after validating the
//! header row and finishes the import in a background task so slow
//! connections and gateway timeouts cannot interrupt it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::basefile;
use crate::cto;
use crate::designers;
use crate::error::AppError;
use crate::ledger;
use crate::locks;
use crate::sessions::{IMPORT_WAIT, SWEEP_INTERVAL};
use crate::state::AppState;
use crate::tabulations;
use crate::xlsx::{self, ColumnCheck};

/// Upload size cap, field teams occasionally send the whole state's base.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;
/// Wall-clock budget for receiving one upload request. A client that stalls
/// past this gets a 408 instead of holding the connection open.
pub const UPLOAD_BUDGET: Duration = Duration::from_secs(120);
/// Temp files older than this are swept by the hourly cleanup.
const TEMP_MAX_AGE: Duration = Duration::from_secs(60 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Builds the full route table.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/users/online", get(users_online))
        .route("/api/users/heartbeat", post(heartbeat))
        .route("/api/projetistas", get(list_designers).post(add_designer))
        .route("/api/projetistas/:nome", delete(delete_designer))
        .route("/api/projetistas/:nome/password", put(update_designer_password))
        .route("/api/projetistas/:nome/name", put(update_designer_name))
        .route("/api/tabulacoes", get(list_tabulations).post(add_tabulation))
        .route("/api/tabulacoes/:nome", delete(delete_tabulation))
        .route(
            "/api/upload-base",
            post(upload_base)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
                .layer(TimeoutLayer::new(UPLOAD_BUDGET)),
        )
        .route("/api/base.xlsx", get(download_base))
        .route("/api/base-last-modified", get(base_last_modified))
        .route("/api/base/delete", delete(delete_base))
        .route("/api/ctos/nearby", get(ctos_nearby))
        .route("/api/vi-ala/next", get(ledger_next))
        .route("/api/vi-ala/save", post(ledger_save))
        .route("/api/vi-ala/list", get(ledger_list))
        .route("/api/vi-ala/ensure-base", get(ledger_ensure))
        .route("/api/vi-ala.xlsx", get(ledger_download))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the listener and serves until shutdown.
pub async fn run(state: Arc<AppState>) -> anyhow::Result<()> {
    let port = state.config.port;
    spawn_background_tasks(state.clone());

    let app = router(state);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("Listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Starts the session sweep and the temp-file cleanup loops.
pub fn spawn_background_tasks(state: Arc<AppState>) {
    let sweeper = state.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let expired = sweeper.sessions.sweep();
            if expired > 0 {
                log::info!("Expired {} idle session(s)", expired);
            }
        }
    });

    let cleaner = state;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            tick.tick().await;
            cleanup_temp_files(&cleaner.config.temp_dir);
        }
    });
}

/// Removes upload leftovers older than [`TEMP_MAX_AGE`].
fn cleanup_temp_files(temp_dir: &std::path::Path) {
    let entries = match std::fs::read_dir(temp_dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("Temp dir not readable: {}", e);
            return;
        }
    };
    let now = std::time::SystemTime::now();
    for entry in entries.flatten() {
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok());
        if matches!(age, Some(age) if age > TEMP_MAX_AGE) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => log::info!("Removed stale temp file {:?}", entry.path()),
                Err(e) => log::warn!("Cannot remove temp file {:?}: {}", entry.path(), e),
            }
        }
    }
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "cto-portal",
        "status": "ok",
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "supabase": state.store.is_some(),
        "uploadInProgress": state.import_gate.is_busy(),
    }))
}

// ---------------------------------------------------------------------------
// Sessions

#[derive(Deserialize)]
struct LoginBody {
    usuario: Option<String>,
    senha: Option<String>,
}

#[derive(Deserialize)]
struct UserBody {
    usuario: Option<String>,
}

fn required<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str, AppError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(AppError::Validation(message.to_string())),
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, AppError> {
    let usuario = required(&body.usuario, "Usuário é obrigatório")?;
    let senha = required(&body.senha, "Senha é obrigatória")?;

    let ok = designers::authenticate(
        state.store.as_ref(),
        &state.config.data_dir,
        state.passwords.as_ref(),
        usuario,
        senha,
    )
    .await?;

    if !ok {
        // Same answer for unknown user and wrong password.
        return Ok(Json(json!({
            "success": false,
            "error": "Usuário ou senha incorretos",
        })));
    }

    state.sessions.login(usuario);
    Ok(Json(json!({
        "success": true,
        "message": "Login realizado com sucesso",
    })))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UserBody>,
) -> Result<Json<Value>, AppError> {
    let usuario = required(&body.usuario, "Usuário é obrigatório")?;
    state.sessions.logout(usuario);
    Ok(Json(json!({ "success": true })))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UserBody>,
) -> Result<Json<Value>, AppError> {
    let usuario = required(&body.usuario, "Usuário é obrigatório")?;
    let online = state.sessions.heartbeat(usuario);
    Ok(Json(json!({ "success": true, "online": online })))
}

async fn users_online(State(state): State<Arc<AppState>>) -> Json<Value> {
    // A running import monopolizes the remote store; hold the presence
    // query until it finishes rather than answering with a timeout.
    if state.import_gate.is_busy() {
        log::info!("Presence query waiting for the running import");
        if !state.import_gate.wait_idle(IMPORT_WAIT).await {
            log::warn!("Import still running after the wait window, answering anyway");
        }
    }

    let snapshot = state.sessions.snapshot();
    let mut users_info: HashMap<String, Value> = HashMap::new();
    for (nome, session) in &snapshot.sessions {
        users_info.insert(
            nome.clone(),
            json!({ "status": "online", "loginTime": session.login_time }),
        );
    }
    for (nome, logout_time) in &snapshot.logged_out {
        users_info
            .entry(nome.clone())
            .or_insert_with(|| json!({ "status": "offline", "logoutTime": logout_time }));
    }

    Json(json!({
        "success": true,
        "onlineUsers": snapshot.online,
        "usersInfo": users_info,
    }))
}

// ---------------------------------------------------------------------------
// Designers

#[derive(Deserialize)]
struct DesignerBody {
    nome: Option<String>,
    senha: Option<String>,
}

#[derive(Deserialize)]
struct PasswordBody {
    senha: Option<String>,
}

#[derive(Deserialize)]
struct RenameBody {
    #[serde(rename = "novoNome")]
    novo_nome: Option<String>,
}

async fn roster_names(state: &AppState) -> Result<Vec<String>, AppError> {
    let roster = designers::read_all(state.store.as_ref(), &state.config.data_dir).await?;
    Ok(roster.into_iter().map(|d| d.nome).collect())
}

async fn list_designers(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    // Names only, passwords never leave the server.
    let nomes = roster_names(&state).await?;
    Ok(Json(json!({ "success": true, "projetistas": nomes })))
}

async fn add_designer(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DesignerBody>,
) -> Result<Json<Value>, AppError> {
    let nome = required(&body.nome, "Nome do projetista é obrigatório")?;
    let senha = required(&body.senha, "Senha é obrigatória")?;

    designers::add(
        state.store.as_ref(),
        &state.locks,
        &state.config.data_dir,
        nome,
        &state.passwords.protect(senha),
    )
    .await?;

    let nomes = roster_names(&state).await?;
    Ok(Json(json!({
        "success": true,
        "projetistas": nomes,
        "message": format!("Projetista '{}' adicionado com sucesso", nome),
    })))
}

async fn delete_designer(
    State(state): State<Arc<AppState>>,
    Path(nome): Path<String>,
) -> Result<Json<Value>, AppError> {
    let nome = nome.trim().to_string();
    if nome.is_empty() {
        return Err(AppError::Validation(
            "Nome do projetista não pode estar vazio".into(),
        ));
    }

    let removed = designers::remove(
        state.store.as_ref(),
        &state.locks,
        &state.config.data_dir,
        &nome,
    )
    .await?;
    let nomes = roster_names(&state).await?;

    if removed {
        Ok(Json(json!({
            "success": true,
            "projetistas": nomes,
            "message": format!("Projetista '{}' deletado com sucesso", nome),
        })))
    } else {
        Ok(Json(json!({
            "success": false,
            "projetistas": nomes,
            "message": "Projetista não encontrado",
        })))
    }
}

async fn update_designer_password(
    State(state): State<Arc<AppState>>,
    Path(nome): Path<String>,
    Json(body): Json<PasswordBody>,
) -> Result<Json<Value>, AppError> {
    let nome = nome.trim().to_string();
    if nome.is_empty() {
        return Err(AppError::Validation(
            "Nome do projetista não pode estar vazio".into(),
        ));
    }
    let senha = required(&body.senha, "Senha é obrigatória")?;
    if senha.len() < 4 {
        return Err(AppError::Validation(
            "A senha deve ter pelo menos 4 caracteres".into(),
        ));
    }

    designers::set_password(
        state.store.as_ref(),
        &state.locks,
        &state.config.data_dir,
        state.passwords.as_ref(),
        &nome,
        senha,
    )
    .await?;
    Ok(Json(json!({
        "success": true,
        "message": "Senha atualizada com sucesso",
    })))
}

async fn update_designer_name(
    State(state): State<Arc<AppState>>,
    Path(nome): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Value>, AppError> {
    let nome = nome.trim().to_string();
    if nome.is_empty() {
        return Err(AppError::Validation(
            "Nome do projetista não pode estar vazio".into(),
        ));
    }
    let novo_nome = required(&body.novo_nome, "Novo nome é obrigatório")?;
    if novo_nome.len() < 2 {
        return Err(AppError::Validation(
            "O novo nome deve ter pelo menos 2 caracteres".into(),
        ));
    }

    designers::rename(
        state.store.as_ref(),
        &state.locks,
        &state.config.data_dir,
        &nome,
        novo_nome,
    )
    .await?;

    // A logged-in designer keeps their session under the new name.
    state.sessions.rename(&nome, novo_nome);

    Ok(Json(json!({
        "success": true,
        "message": "Nome atualizado com sucesso",
        "novoNome": novo_nome,
    })))
}

// ---------------------------------------------------------------------------
// Tabulations

#[derive(Deserialize)]
struct TabulationBody {
    nome: Option<String>,
}

async fn list_tabulations(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let labels =
        tabulations::read_all(state.store.as_ref(), &state.locks, &state.config.data_dir).await?;
    Ok(Json(json!({ "success": true, "tabulacoes": labels })))
}

async fn add_tabulation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TabulationBody>,
) -> Result<Json<Value>, AppError> {
    let nome = required(&body.nome, "Nome da tabulação é obrigatório")?;
    tabulations::add(state.store.as_ref(), &state.locks, &state.config.data_dir, nome).await?;
    let labels =
        tabulations::read_all(state.store.as_ref(), &state.locks, &state.config.data_dir).await?;
    Ok(Json(json!({
        "success": true,
        "tabulacoes": labels,
        "message": format!("Tabulação '{}' adicionada com sucesso", nome.trim()),
    })))
}

async fn delete_tabulation(
    State(state): State<Arc<AppState>>,
    Path(nome): Path<String>,
) -> Result<Json<Value>, AppError> {
    let removed =
        tabulations::remove(state.store.as_ref(), &state.locks, &state.config.data_dir, &nome)
            .await?;
    let labels =
        tabulations::read_all(state.store.as_ref(), &state.locks, &state.config.data_dir).await?;
    if removed {
        Ok(Json(json!({
            "success": true,
            "tabulacoes": labels,
            "message": format!("Tabulação '{}' deletada com sucesso", nome.trim()),
        })))
    } else {
        Ok(Json(json!({
            "success": false,
            "tabulacoes": labels,
            "message": "Tabulação não encontrada",
        })))
    }
}

// ---------------------------------------------------------------------------
// Dataset

fn accepted_upload_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".xlsx") || lower.ends_with(".xls")
}

async fn upload_base(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, AppError> {
    let mut staged: Option<(PathBuf, u64)> = None;
    let mut file_name = String::new();
    let mut usuario = "Sistema".to_string();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("Upload inválido: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().unwrap_or("upload.xlsx").to_string();
                if !accepted_upload_name(&file_name) {
                    return Err(AppError::Validation(
                        "Formato de arquivo inválido. Apenas arquivos Excel (.xlsx ou .xls) são aceitos."
                            .into(),
                    ));
                }
                state.config.ensure_dirs()?;
                let temp_path = state
                    .config
                    .temp_dir
                    .join(format!("upload-{}.xlsx", Uuid::new_v4()));
                // Stream the body straight to disk, the upload is never
                // held whole in memory.
                let mut out = tokio::fs::File::create(&temp_path).await?;
                let mut written = 0u64;
                loop {
                    let chunk = match field.chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tokio::fs::remove_file(&temp_path).await;
                            return Err(AppError::Validation(format!(
                                "Erro ao receber arquivo: {}",
                                e
                            )));
                        }
                    };
                    written += chunk.len() as u64;
                    if let Err(e) = out.write_all(&chunk).await {
                        let _ = tokio::fs::remove_file(&temp_path).await;
                        return Err(AppError::Io(e));
                    }
                }
                out.flush().await?;
                staged = Some((temp_path, written));
            }
            "usuario" => {
                if let Ok(text) = field.text().await {
                    if !text.trim().is_empty() {
                        usuario = text.trim().to_string();
                    }
                }
            }
            _ => {}
        }
    }

    let Some((temp_path, file_size)) = staged else {
        return Err(AppError::Validation("Nenhum arquivo foi enviado".into()));
    };
    log::info!(
        "Upload '{}' received ({} bytes), staged at {:?}",
        file_name,
        file_size,
        temp_path
    );

    // Header-row probe before acknowledging, so an unusable file fails fast.
    let probe_path = temp_path.clone();
    let check = tokio::task::spawn_blocking(move || xlsx::validate_columns(&probe_path))
        .await
        .map_err(|e| AppError::Internal(format!("validation task failed: {}", e)))?;
    match check {
        Ok(ColumnCheck::Valid) => {}
        Ok(ColumnCheck::Missing(missing)) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(AppError::Validation(format!(
                "Arquivo inválido. Colunas obrigatórias ausentes: {}",
                missing.join(", ")
            )));
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }
    }

    // Acknowledge now; the import and file rotation run in the background.
    tokio::spawn(process_upload(
        state.clone(),
        temp_path,
        file_name.clone(),
        file_size,
        usuario,
    ));

    Ok(Json(json!({
        "success": true,
        "message": "Upload recebido! Validando e processando arquivo em background...",
        "processing": true,
        "fileName": file_name,
        "fileSize": file_size,
    })))
}

/// Background half of the upload: remote import, then file rotation.
async fn process_upload(
    state: Arc<AppState>,
    temp_path: PathBuf,
    file_name: String,
    file_size: u64,
    usuario: String,
) {
    let _permit = state.import_gate.begin();

    if let Some(store) = &state.store {
        let parse_path = temp_path.clone();
        let parsed =
            tokio::task::spawn_blocking(move || xlsx::open_first_sheet(&parse_path)).await;
        match parsed {
            Ok(Ok(range)) => {
                match cto::replace_all(store, &range, &file_name, file_size, &usuario).await {
                    Ok(stats) => log::info!(
                        "Import finished: {} imported, {} invalid of {} rows",
                        stats.imported_rows,
                        stats.invalid_rows,
                        stats.total_rows
                    ),
                    // The file still becomes the current dataset; the next
                    // upload or a manual retry can repopulate the table.
                    Err(e) => log::error!("Remote import failed: {}", e),
                }
            }
            Ok(Err(e)) => log::error!("Cannot parse upload: {}", e),
            Err(e) => log::error!("Import task failed: {}", e),
        }
    } else {
        log::warn!("Supabase not configured, keeping the dataset on file only");
    }

    let rotation = {
        let dir = state.config.data_dir.clone();
        let upload = temp_path.clone();
        state
            .locks
            .with_lock(locks::BASE, async move {
                tokio::task::spawn_blocking(move || {
                    basefile::rotate(&dir, &upload, chrono::Local::now().date_naive())
                })
                .await
                .map_err(|e| AppError::Internal(format!("rotation task failed: {}", e)))?
                .map_err(AppError::from)
            })
            .await
    };
    match rotation {
        Ok(target) => log::info!("Dataset rotation complete, current file {:?}", target),
        Err(e) => {
            log::error!("Dataset rotation failed: {}", e);
            if let Err(e) = tokio::fs::remove_file(&temp_path).await {
                log::warn!("Stale upload left at {:?}: {}", temp_path, e);
            }
        }
    }
}

fn xlsx_attachment(file_name: &str, bytes: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, XLSX_MIME)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name),
        )
        .body(axum::body::Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn download_base(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if let Some(store) = &state.store {
        match cto::export_remote(store).await {
            Ok(buffer) => return Ok(xlsx_attachment("base.xlsx", buffer)),
            Err(e) => log::warn!("Remote export failed, serving the file: {}", e),
        }
    }

    let Some(path) = basefile::select_current(&state.config.data_dir) else {
        return Err(AppError::NotFound("Nenhuma base de dados encontrada".into()));
    };
    // The selector never yields backups, but a served backup would silently
    // show stale data, so check the name again before reading it.
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    if basefile::is_backup_name(name) {
        return Err(AppError::Internal("arquivo atual inválido".into()));
    }
    let bytes = tokio::fs::read(&path).await?;
    Ok(xlsx_attachment("base.xlsx", bytes))
}

async fn base_last_modified(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let mut has_data = false;
    let mut last_modified: Option<String> = None;

    if let Some(store) = &state.store {
        match store.count(cto::TABLE).await {
            Ok(n) => has_data = n > 0,
            Err(e) => log::warn!("Cannot count CTOs: {}", e),
        }
        if has_data {
            match cto::last_upload_time(store).await {
                Ok(ts) => last_modified = ts,
                Err(e) => log::warn!("Cannot read upload history: {}", e),
            }
        }
    }

    // File mtime covers both file-only mode and a history table with no
    // usable timestamp.
    if state.store.is_none() || (has_data && last_modified.is_none()) {
        if let Some(mtime) = basefile::current_mtime(&state.config.data_dir) {
            has_data = true;
            last_modified = Some(chrono::DateTime::<chrono::Utc>::from(mtime).to_rfc3339());
        }
    }

    if !has_data {
        return Ok(Json(json!({
            "success": true,
            "hasData": false,
            "message": "Não consta nenhuma base de dados",
        })));
    }
    match last_modified {
        Some(ts) => Ok(Json(json!({
            "success": true,
            "hasData": true,
            "lastModified": ts,
        }))),
        None => Ok(Json(json!({
            "success": true,
            "hasData": true,
            "message": "Base de dados existe mas data de atualização não disponível",
        }))),
    }
}

async fn delete_base(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let mut deleted_count = 0u64;
    if let Some(store) = &state.store {
        match store.clear_table(cto::TABLE).await {
            Ok(n) => deleted_count = n,
            Err(e) => log::warn!("Remote clear failed, deleting the files anyway: {}", e),
        }
    }

    let dir = state.config.data_dir.clone();
    let deleted_files = state
        .locks
        .with_lock(locks::BASE, async move {
            Ok(basefile::delete_current_files(&dir))
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "deletedCount": deleted_count,
        "deletedFiles": deleted_files,
        "message": "Base de dados deletada com sucesso",
    })))
}

#[derive(Deserialize)]
struct NearbyParams {
    lat: Option<f64>,
    lng: Option<f64>,
    radius: Option<f64>,
}

async fn ctos_nearby(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearbyParams>,
) -> Result<Json<Value>, AppError> {
    let (Some(lat), Some(lng)) = (params.lat, params.lng) else {
        return Err(AppError::Validation(
            "Latitude e longitude são obrigatórios".into(),
        ));
    };
    let radius = params.radius.unwrap_or(cto::NEARBY_DEFAULT_RADIUS_M);

    let Some(store) = &state.store else {
        return Err(AppError::Unavailable("Supabase não disponível".into()));
    };
    let ctos = cto::nearby(store, lat, lng, radius).await?;
    Ok(Json(json!({
        "success": true,
        "count": ctos.len(),
        "ctos": ctos,
    })))
}

// ---------------------------------------------------------------------------
// Ledger

async fn ledger_next(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let store = state.store.clone();
    let dir = state.config.data_dir.clone();
    let id = state
        .locks
        .with_lock(locks::LEDGER, async move {
            ledger::next_id(store.as_ref(), &dir).await
        })
        .await?;
    Ok(Json(json!({ "success": true, "viAla": id })))
}

fn body_text(body: &Value, key: &str) -> String {
    match body.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

async fn ledger_save(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let vi_ala = body_text(&body, "viAla").trim().to_string();
    if vi_ala.is_empty() {
        return Err(AppError::Validation("VI ALA é obrigatório".into()));
    }

    let entry = ledger::LedgerEntry {
        vi_ala,
        ala: body_text(&body, "ala"),
        data: body_text(&body, "data"),
        projetista: body_text(&body, "projetista"),
        cidade: body_text(&body, "cidade"),
        endereco: body_text(&body, "endereco"),
        latitude: body_text(&body, "latitude"),
        longitude: body_text(&body, "longitude"),
    };

    let store = state.store.clone();
    let dir = state.config.data_dir.clone();
    state
        .locks
        .with_lock(locks::LEDGER, async move {
            ledger::save(store.as_ref(), &dir, &entry).await
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Registro salvo com sucesso",
    })))
}

async fn ledger_list(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let recent = ledger::recent(state.store.as_ref(), &state.config.data_dir).await?;
    Ok(Json(json!({ "success": true, "viAlas": recent })))
}

async fn ledger_ensure(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let dir = state.config.data_dir.clone();
    state
        .locks
        .with_lock(locks::LEDGER, async move { ledger::ensure_file(&dir) })
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn ledger_download(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let path = ledger::file_path(&state.config.data_dir);
    if !path.exists() {
        return Err(AppError::NotFound(
            "Arquivo base_VI ALA.xlsx não encontrado".into(),
        ));
    }
    let bytes = tokio::fs::read(&path).await?;
    Ok(xlsx_attachment("base_VI ALA.xlsx", bytes))
}
