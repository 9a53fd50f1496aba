use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_MAX_VALUE_LENGTH: u64 = 100;
pub const DEFAULT_DATABASE_PATH: &str = "honeypot.db";
pub const DEFAULT_POOL_SIZE: u32 = 8;
pub const DEFAULT_PORT: u16 = 8200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Longest accepted field value, in characters.
    pub max_value_length: u64,
    pub database_path: PathBuf,
    pub database_pool_size: u32,
    /// Fallback tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub max_request_bytes: Option<usize>,
    pub metrics_enabled: bool,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_value_length: DEFAULT_MAX_VALUE_LENGTH,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            database_pool_size: DEFAULT_POOL_SIZE,
            log_level: "info".into(),
            log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: true,
            max_request_bytes: None,
            metrics_enabled: false,
            port: DEFAULT_PORT,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let max_value_length = u64_or("HP_MAX_VALUE_LENGTH", defaults.max_value_length)?;
        let database_path = non_empty_var("HP_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);
        let database_pool_size = match parse_optional_u64("HP_DATABASE_POOL_SIZE")? {
            Some(0) => return Err(anyhow!("HP_DATABASE_POOL_SIZE must be at least 1")),
            Some(n) => u32::try_from(n).context("HP_DATABASE_POOL_SIZE is too large")?,
            None => defaults.database_pool_size,
        };
        let log_level = non_empty_var("HP_LOG_LEVEL")
            .map(|s| s.to_ascii_lowercase())
            .unwrap_or(defaults.log_level);
        let log_file = non_empty_var("LOG_FILE");

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: u64_or("LOG_ROTATE_KEEP", 1)? as usize,
            compress: bool_or("LOG_ROTATE_COMPRESS", false)?,
        };

        let log_stdout = bool_or("HP_LOG_STDOUT", defaults.log_stdout)?;
        let max_request_bytes = parse_optional_u64("HP_MAX_REQUEST_BYTES")?;
        let metrics_enabled = bool_or("HP_METRICS_ENABLED", false)?;
        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).context("PORT must fit in 16 bits")?,
            None => defaults.port,
        };

        Ok(Self {
            max_value_length,
            database_path,
            database_pool_size,
            log_level,
            log_file,
            rotation,
            log_stdout,
            max_request_bytes: max_request_bytes.map(|v| v as usize),
            metrics_enabled,
            port,
        })
    }
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn u64_or(var: &str, default: u64) -> Result<u64> {
    Ok(parse_optional_u64(var)?.unwrap_or(default))
}

fn bool_or(var: &str, default: bool) -> Result<bool> {
    Ok(parse_bool_env(var)?.unwrap_or(default))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
