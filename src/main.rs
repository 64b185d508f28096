use std::sync::Arc;

use cto_portal::app;
use cto_portal::config::Config;
use cto_portal::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = Config::from_env();
    config.ensure_dirs()?;

    let state = AppState::new(config);
    if let Some(store) = &state.store {
        // Startup probe only, missing tables are reported but not fatal.
        store
            .check_tables(&["ctos", "projetistas", "tabulacoes", "vi_ala", "upload_history"])
            .await;
    }

    app::run(Arc::new(state)).await
}
