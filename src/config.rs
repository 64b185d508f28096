//! Runtime configuration read from the environment.
//!
//! All knobs come from environment variables (a `.env` file is honored via
//! `dotenvy` in `main`). The Supabase pair is optional: when either variable
//! is missing the server runs in file-only mode.

use std::env;
use std::path::PathBuf;

/// Server configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Directory holding every Excel artifact (dataset, accounts, ledger).
    pub data_dir: PathBuf,
    /// Scratch directory for in-flight uploads, lives under `data_dir`.
    pub temp_dir: PathBuf,
    /// Supabase project URL, e.g. `https://xyz.supabase.co`.
    pub supabase_url: Option<String>,
    /// Supabase service role key.
    pub supabase_service_key: Option<String>,
}

impl Config {
    /// Builds the configuration from the process environment.
    ///
    /// `PORT` defaults to 3001 and `DATA_DIR` to `./data`. Invalid values
    /// fall back to the defaults with a warning rather than aborting.
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|v| {
                v.parse::<u16>()
                    .map_err(|e| log::warn!("Invalid PORT value '{}': {}", v, e))
                    .ok()
            })
            .unwrap_or(3001);

        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let temp_dir = data_dir.join("temp");

        let supabase_url = env::var("SUPABASE_URL").ok().filter(|v| !v.is_empty());
        let supabase_service_key = env::var("SUPABASE_SERVICE_KEY")
            .ok()
            .filter(|v| !v.is_empty());

        Config {
            port,
            data_dir,
            temp_dir,
            supabase_url,
            supabase_service_key,
        }
    }

    /// Whether both Supabase variables are present.
    pub fn supabase_configured(&self) -> bool {
        self.supabase_url.is_some() && self.supabase_service_key.is_some()
    }

    /// Creates `data_dir` and `temp_dir` if they do not exist yet.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Only checks the fallback values, so clear the relevant vars first.
        env::remove_var("PORT");
        env::remove_var("DATA_DIR");
        let cfg = Config::from_env();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.temp_dir, PathBuf::from("./data/temp"));
    }

    #[test]
    fn supabase_requires_both_vars() {
        let cfg = Config {
            port: 3001,
            data_dir: PathBuf::from("./data"),
            temp_dir: PathBuf::from("./data/temp"),
            supabase_url: Some("https://example.supabase.co".into()),
            supabase_service_key: None,
        };
        assert!(!cfg.supabase_configured());
    }
}
