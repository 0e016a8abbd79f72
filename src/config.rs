use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;

use crate::outbound::Coalesce;
use crate::wire::{preferred_encoding, Encoding};

pub const NAGLE_ENV: &str = "MSGSTREAM_NAGLE_MS";
pub const READ_TIMEOUT_ENV: &str = "MSGSTREAM_READ_TIMEOUT_MS";

const DEFAULT_NAGLE_MS: i64 = -1;

/// Per-pipe behaviour shared by every session an endpoint creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    pub coalesce: Coalesce,
    /// Deadline for blocking reads and metadata waits. `None` blocks forever.
    pub read_timeout: Option<Duration>,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            coalesce: Coalesce::from_delay_ms(DEFAULT_NAGLE_MS),
            read_timeout: None,
        }
    }
}

impl PipeOptions {
    pub fn with_delay_ms(delay_ms: i64) -> Self {
        Self {
            coalesce: Coalesce::from_delay_ms(delay_ms),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub endpoint_id: String,
    #[serde(default = "default_nagle_ms")]
    pub nagle_ms: i64,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub config_path: Option<PathBuf>,
}

fn default_nagle_ms() -> i64 {
    DEFAULT_NAGLE_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint_id: "local".to_string(),
            nagle_ms: DEFAULT_NAGLE_MS,
            read_timeout_ms: None,
            encoding: None,
            log_file: None,
            config_path: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        cfg.apply_env_overrides()?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(raw) = std::env::var(NAGLE_ENV) {
            self.nagle_ms = raw
                .trim()
                .parse()
                .with_context(|| format!("{NAGLE_ENV}={raw}"))?;
        }
        if let Ok(raw) = std::env::var(READ_TIMEOUT_ENV) {
            let raw = raw.trim();
            self.read_timeout_ms = if raw.is_empty() {
                None
            } else {
                Some(
                    raw.parse()
                        .with_context(|| format!("{READ_TIMEOUT_ENV}={raw}"))?,
                )
            };
        }
        Ok(())
    }

    pub fn normalize(&mut self) {
        self.endpoint_id = self.endpoint_id.trim().to_string();
        if let Some(enc) = self.encoding.as_mut() {
            *enc = enc.trim().to_lowercase();
        }
        if let (Some(log), Some(cfg_path)) = (self.log_file.as_ref(), self.config_path.as_ref()) {
            if log.is_relative() {
                if let Some(dir) = cfg_path.parent() {
                    self.log_file = Some(dir.join(log));
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_endpoint_id(&self.endpoint_id).context("endpoint_id")?;
        if let Some(enc) = self.encoding.as_deref() {
            if enc != "json" && enc != "msgpack" {
                anyhow::bail!("encoding must be json or msgpack, got {enc}");
            }
        }
        if self.read_timeout_ms == Some(0) {
            anyhow::bail!("read_timeout_ms must be positive when set");
        }
        Ok(())
    }

    pub fn encoding(&self) -> Encoding {
        match self.encoding.as_deref() {
            Some(enc) => preferred_encoding(enc),
            None => Encoding::MsgPack,
        }
    }

    pub fn pipe_options(&self) -> PipeOptions {
        PipeOptions {
            coalesce: Coalesce::from_delay_ms(self.nagle_ms),
            read_timeout: self.read_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn validate_endpoint_id(id: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:@-]{0,127}$").expect("endpoint id pattern")
    });
    if PATTERN.is_match(id) {
        Ok(())
    } else {
        anyhow::bail!("invalid endpoint id: {id:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    fn write_config(name: &str, json: &str) -> PathBuf {
        let tmp = env::temp_dir().join(format!("msgstream-config-{name}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&tmp).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, json).unwrap();
        cfg_path
    }

    #[test]
    fn load_config_and_normalize() {
        let cfg_path = write_config(
            "ok",
            r#"{
                "endpoint_id": "  server-1 ",
                "nagle_ms": 25,
                "read_timeout_ms": 5000,
                "encoding": "JSON",
                "log_file": "logs/msgstream.log"
            }"#,
        );

        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.endpoint_id, "server-1");
        assert_eq!(cfg.encoding(), Encoding::Json);
        assert_eq!(cfg.config_path.as_ref().unwrap(), &cfg_path);
        assert_eq!(
            cfg.log_file.as_ref().unwrap(),
            &cfg_path.parent().unwrap().join("logs/msgstream.log")
        );

        let opts = cfg.pipe_options();
        assert_eq!(opts.coalesce, Coalesce::Window(Duration::from_millis(25)));
        assert_eq!(opts.read_timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn defaults_send_immediately_and_block_forever() {
        let cfg_path = write_config("defaults", r#"{ "endpoint_id": "client" }"#);
        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.encoding(), Encoding::MsgPack);
        let opts = cfg.pipe_options();
        assert_eq!(opts.coalesce, Coalesce::Immediate);
        assert_eq!(opts.read_timeout, None);
        assert_eq!(opts, PipeOptions::default());
    }

    #[test]
    fn reject_invalid_endpoint_id() {
        let cfg_path = write_config("bad-id", r#"{ "endpoint_id": "has space" }"#);
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid endpoint id"));
    }

    #[test]
    fn reject_unknown_encoding() {
        let cfg_path = write_config(
            "bad-enc",
            r#"{ "endpoint_id": "client", "encoding": "cbor" }"#,
        );
        let err = Config::load(&cfg_path).unwrap_err();
        assert!(err.to_string().contains("encoding must be json or msgpack"));
    }
}
