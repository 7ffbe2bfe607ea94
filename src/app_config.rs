//! Config file loading for CLI defaults.
//!
//! The file is a flat `key = value` list. Values set here override the
//! engine defaults; command-line flags override the file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chemfetch_core::{CacheBackend, EngineConfig, Expiry};
use clap::ValueEnum;

use crate::cli::OutputFormat;

/// Values read from the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// Requests per second (0 disables limiting).
    pub rate_limit: Option<u32>,
    /// Retries after the first attempt.
    pub max_retries: Option<u8>,
    /// Keys per batch request.
    pub batch_size: Option<usize>,
    /// Default property list.
    pub properties: Option<Vec<String>>,
    /// Whether responses are cached.
    pub cache: Option<bool>,
    /// SQLite cache file.
    pub cache_path: Option<PathBuf>,
    /// Cache entry lifetime in days (0 keeps entries forever).
    pub cache_expiry_days: Option<u64>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: Option<u64>,
    /// PUG-REST base URL.
    pub rest_base: Option<String>,
    /// PUG-View base URL.
    pub view_base: Option<String>,
    /// Default output format.
    pub format: Option<OutputFormat>,
}

impl FileConfig {
    /// Validates values against the same ranges the CLI accepts.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate_limit) = self.rate_limit
            && rate_limit > 100
        {
            bail!("Invalid config value for `rate_limit`: {rate_limit}. Expected range: 0..=100");
        }
        if let Some(max_retries) = self.max_retries
            && max_retries > 10
        {
            bail!(
                "Invalid config value for `max_retries`: {max_retries}. Expected range: 0..=10"
            );
        }
        if let Some(batch_size) = self.batch_size
            && !(1..=100).contains(&batch_size)
        {
            bail!("Invalid config value for `batch_size`: {batch_size}. Expected range: 1..=100");
        }
        if let Some(properties) = &self.properties
            && properties.is_empty()
        {
            bail!("Invalid config value for `properties`: expected at least one name");
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("request_timeout_secs", self.request_timeout_secs)?;
        Ok(())
    }

    /// Applies every value that is set to `config`.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(rate_limit) = self.rate_limit {
            config.max_requests = rate_limit;
        }
        if let Some(max_retries) = self.max_retries {
            config.max_attempts = u32::from(max_retries) + 1;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(path) = &self.cache_path {
            config.cache = CacheBackend::Sqlite(path.clone());
        }
        if self.cache == Some(false) {
            config.cache = CacheBackend::Disabled;
        }
        if let Some(days) = self.cache_expiry_days {
            config.expiry = if days == 0 {
                Expiry::Never
            } else {
                Expiry::After(Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
            };
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(base) = &self.rest_base {
            config.rest_base.clone_from(base);
        }
        if let Some(base) = &self.view_base {
            config.view_base.clone_from(base);
        }
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/chemfetch/config.toml`
/// 2. `$HOME/.config/chemfetch/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("chemfetch")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("chemfetch")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file from the default path, if one exists.
pub fn load_default_file_config() -> Result<Option<(PathBuf, FileConfig)>> {
    let Some(path) = resolve_default_config_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    let config = load_file_config(&path)?;
    Ok(Some((path, config)))
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {}", line_index + 1);

        match key {
            "rate_limit" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.rate_limit = Some(narrow(parsed).with_context(context)?);
            }
            "max_retries" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.max_retries = Some(narrow(parsed).with_context(context)?);
            }
            "batch_size" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                cfg.batch_size = Some(narrow(parsed).with_context(context)?);
            }
            "properties" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.properties = Some(split_list(&parsed));
            }
            "cache" => {
                cfg.cache = Some(parse_boolean(value).with_context(context)?);
            }
            "cache_path" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.cache_path = Some(PathBuf::from(parsed));
            }
            "cache_expiry_days" => {
                cfg.cache_expiry_days = Some(parse_integer_u64(value).with_context(context)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "request_timeout_secs" => {
                cfg.request_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "rest_base" => {
                cfg.rest_base = Some(parse_string_literal(value).with_context(context)?);
            }
            "view_base" => {
                cfg.view_base = Some(parse_string_literal(value).with_context(context)?);
            }
            "format" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                let format = OutputFormat::from_str(&parsed, true)
                    .map_err(|error| anyhow!(error))
                    .with_context(context)?;
                cfg.format = Some(format);
            }
            unknown => {
                bail!(
                    "Unknown configuration key: '{}' on line {}",
                    unknown,
                    line_index + 1
                );
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Splits a comma-separated list, dropping empty entries.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn narrow<T: TryFrom<u64>>(value: u64) -> Result<T> {
    T::try_from(value).map_err(|_| anyhow::anyhow!("Integer value {value} out of range"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
