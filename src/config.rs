//! Process configuration loaded from environment variables, plain-struct
//! style (no builder, no layered file/env/flag precedence) matching how
//! the teacher's own binaries read their handful of settings.

use std::path::{Path, PathBuf};

/// Relative directories probed, in order, when `GIST_STATIC_DIR` is unset.
const STATIC_DIR_CANDIDATES: &[&str] = &["./static", "./dist", "./web/dist"];

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub db_path: PathBuf,
    pub static_dir: Option<PathBuf>,
    pub log_level: String,
    pub node_id: i64,
}

impl Config {
    /// Loads from environment, falling back to defaults. `static_dir`
    /// resolution checks `GIST_STATIC_DIR` first, only probing the
    /// filesystem candidates when the override is absent.
    pub fn from_env() -> Self {
        let listen_addr = std::env::var("GIST_LISTEN_ADDR").unwrap_or_else(|_| ":8080".to_string());
        let db_path = std::env::var("GIST_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/gist.db"));
        let log_level = std::env::var("GIST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let node_id = std::env::var("GIST_NODE_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(0);

        let static_dir = std::env::var("GIST_STATIC_DIR")
            .map(PathBuf::from)
            .ok()
            .or_else(detect_static_dir);

        Config { listen_addr, db_path: normalize(&db_path), static_dir, log_level, node_id }
    }

    #[cfg(test)]
    fn from_env_with(vars: &[(&str, &str)]) -> Self {
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        let config = Self::from_env();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        config
    }
}

fn detect_static_dir() -> Option<PathBuf> {
    STATIC_DIR_CANDIDATES.iter().map(PathBuf::from).find(|p| p.is_dir())
}

fn normalize(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(p) => p,
        Err(_) => path.to_path_buf(),
    }
}
