use std::{collections::HashSet, path::PathBuf};

use url::Url;

use crate::error::ApiError;

const DEFAULT_PORT: u16 = 8010;
const DEFAULT_YT_DLP: &str = "yt-dlp";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub downloads_dir: PathBuf,
    pub yt_dlp_command: String,
    pub allowed_origins: HashSet<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let downloads_dir = env_value("DOWNLOADS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("downloads"));
        let yt_dlp_command = env_value("YT_DLP_PATH").unwrap_or_else(|| DEFAULT_YT_DLP.to_string());

        Ok(Self {
            bind_addr: resolve_bind_addr(env_value("APP_ADDR"), env_value("PORT")),
            downloads_dir,
            yt_dlp_command,
            allowed_origins: parse_allowed_origins(env_value("ALLOWED_ORIGINS").as_deref())?,
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    let port = port
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn parse_allowed_origins(configured: Option<&str>) -> Result<HashSet<String>, ApiError> {
    let origins = configured
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty())
        .unwrap_or_else(|| {
            vec![
                format!("http://127.0.0.1:{DEFAULT_PORT}"),
                format!("http://localhost:{DEFAULT_PORT}"),
            ]
        });

    origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. Expected values like https://example.com"
                ))
            })
        })
        .collect()
}

pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
