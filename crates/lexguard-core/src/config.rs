use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::{db::Db, types::DEFAULT_ANALYSIS_TIMEOUT};

/// Full application configuration.
/// Non-sensitive fields are seeded to and loaded from the DB `config` table.
/// Secrets (JWT secret, provider API key) and the admin subject list come from env/.env only.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,
    pub jwt_secret: String,
    /// Comma-separated token subjects allowed to read the process log stream.
    pub admin_subjects: String,

    // Analysis
    /// "gemini" (default) or "ollama".
    pub analysis_backend: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub analysis_timeout_s: u64,
    pub provider_request_timeout_s: u64,

    /// Extension substituted into plain download filenames. Empty keeps the stored name.
    pub download_extension: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "store".into(),
            web_bind: "127.0.0.1".into(),
            web_port: 3141,
            jwt_secret: String::new(),
            admin_subjects: String::new(),
            analysis_backend: "gemini".into(),
            gemini_api_key: String::new(),
            gemini_base_url: "https://generativelanguage.googleapis.com".into(),
            gemini_model: "gemini-1.5-flash".into(),
            ollama_url: "http://127.0.0.1:11434".into(),
            ollama_model: "llama3.1".into(),
            analysis_timeout_s: DEFAULT_ANALYSIS_TIMEOUT.as_secs(),
            provider_request_timeout_s: 300,
            download_extension: "pdf".into(),
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return HashMap::new();
    };
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn is_admin(&self, subject: &str) -> bool {
        let subject = subject.trim();
        !subject.is_empty()
            && self
                .admin_subjects
                .split(',')
                .any(|s| s.trim() == subject)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_s.max(1))
    }

    pub fn provider_request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_request_timeout_s.max(1))
    }

    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("lexguard.db")
    }

    pub fn blob_root(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("blobs")
    }

    /// Write all non-sensitive fields to DB if not already present (first-run seeding).
    pub fn seed_db(&self, db: &Db) -> Result<()> {
        let entries: &[(&str, String)] = &[
            ("web_bind", self.web_bind.clone()),
            ("web_port", self.web_port.to_string()),
            ("analysis_backend", self.analysis_backend.clone()),
            ("gemini_base_url", self.gemini_base_url.clone()),
            ("gemini_model", self.gemini_model.clone()),
            ("ollama_url", self.ollama_url.clone()),
            ("ollama_model", self.ollama_model.clone()),
            ("analysis_timeout_s", self.analysis_timeout_s.to_string()),
            (
                "provider_request_timeout_s",
                self.provider_request_timeout_s.to_string(),
            ),
            ("download_extension", self.download_extension.clone()),
        ];
        for (key, value) in entries {
            db.seed_config(key, value)?;
        }
        Ok(())
    }

    /// Return a new Config with non-sensitive fields overridden from DB values.
    pub fn load_from_db(&self, db: &Db) -> Self {
        let mut c = self.clone();
        let get = |key: &str| db.get_config(key).ok().flatten();
        let get_str = |key: &str, cur: &str| get(key).unwrap_or_else(|| cur.to_string());
        macro_rules! load_num {
            ($key:expr, $field:expr) => {
                if let Some(v) = get($key).and_then(|s| s.parse().ok()) {
                    $field = v;
                }
            };
        }
        c.web_bind = get_str("web_bind", &c.web_bind);
        c.analysis_backend = get_str("analysis_backend", &c.analysis_backend);
        c.gemini_base_url = get_str("gemini_base_url", &c.gemini_base_url);
        c.gemini_model = get_str("gemini_model", &c.gemini_model);
        c.ollama_url = get_str("ollama_url", &c.ollama_url);
        c.ollama_model = get_str("ollama_model", &c.ollama_model);
        c.download_extension = get_str("download_extension", &c.download_extension);
        load_num!("web_port", c.web_port);
        load_num!("analysis_timeout_s", c.analysis_timeout_s);
        load_num!("provider_request_timeout_s", c.provider_request_timeout_s);
        c
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::from_map(&parse_dotenv()))
    }

    fn from_map(dotenv: &HashMap<String, String>) -> Self {
        let d = Config::default();
        Config {
            data_dir: get_str("DATA_DIR", dotenv, &d.data_dir),
            web_bind: get_str("WEB_BIND", dotenv, &d.web_bind),
            web_port: get_u16("WEB_PORT", dotenv, d.web_port),
            jwt_secret: get_str("JWT_SECRET", dotenv, ""),
            admin_subjects: get_str("ADMIN_SUBJECTS", dotenv, ""),
            analysis_backend: get_str("ANALYSIS_BACKEND", dotenv, &d.analysis_backend)
                .to_ascii_lowercase(),
            gemini_api_key: get_str("GEMINI_API_KEY", dotenv, ""),
            gemini_base_url: get_str("GEMINI_BASE_URL", dotenv, &d.gemini_base_url),
            gemini_model: get_str("GEMINI_MODEL", dotenv, &d.gemini_model),
            ollama_url: get_str("OLLAMA_URL", dotenv, &d.ollama_url),
            ollama_model: get_str("OLLAMA_MODEL", dotenv, &d.ollama_model),
            analysis_timeout_s: get_u64("ANALYSIS_TIMEOUT_S", dotenv, d.analysis_timeout_s),
            provider_request_timeout_s: get_u64(
                "PROVIDER_REQUEST_TIMEOUT_S",
                dotenv,
                d.provider_request_timeout_s,
            ),
            download_extension: get_str("DOWNLOAD_EXTENSION", dotenv, &d.download_extension),
        }
    }
}
