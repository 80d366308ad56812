//! Typed configuration for the engine, store and sweeper.
//!
//! Values come from an optional TOML file named by `CASEFLOW_CONFIG`, with
//! `CASEFLOW_*` environment variables layered on top. Loads once at
//! startup, fails fast on anything malformed.

use chrono::{Duration, NaiveTime};
use serde::Deserialize;

use crate::engine::EngineConfig;
use crate::error::{Error, Result};
use crate::sweeper::SweepSchedule;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// SQLite database path. ":memory:" keeps everything in process.
    pub database_path: String,
    /// Claim lease length, in minutes.
    pub lease_minutes: i64,
    /// Horizon of the near-expiry view, in minutes.
    pub near_expiry_minutes: i64,
    pub sweep: SweepConfig,
    pub log_level: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    /// "HH:MM" UTC for a daily sweep. Mutually exclusive with
    /// `every_minutes`; neither set means daily at 03:00.
    pub daily_at: Option<String>,
    /// Period in minutes for a fixed-interval sweep.
    pub every_minutes: Option<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "caseflow.db".to_string(),
            lease_minutes: 60,
            near_expiry_minutes: 15,
            sweep: SweepConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("CASEFLOW_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read config file {path}: {e}")))?;
        Self::from_toml(&text)
    }

    fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("config: {e}")))
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("CASEFLOW_DB") {
            self.database_path = path;
        }
        if let Some(minutes) = int_var("CASEFLOW_LEASE_MINUTES")? {
            self.lease_minutes = minutes;
        }
        if let Some(minutes) = int_var("CASEFLOW_NEAR_EXPIRY_MINUTES")? {
            self.near_expiry_minutes = minutes;
        }
        if let Ok(at) = std::env::var("CASEFLOW_SWEEP_DAILY_AT") {
            self.sweep.daily_at = Some(at);
        }
        if let Some(minutes) = int_var("CASEFLOW_SWEEP_EVERY_MINUTES")? {
            self.sweep.every_minutes = Some(minutes);
        }
        if let Ok(level) = std::env::var("CASEFLOW_LOG") {
            self.log_level = level;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.lease_minutes < 1 {
            return Err(Error::Config(format!(
                "lease_minutes must be positive (got {})",
                self.lease_minutes
            )));
        }
        if self.near_expiry_minutes < 1 {
            return Err(Error::Config(format!(
                "near_expiry_minutes must be positive (got {})",
                self.near_expiry_minutes
            )));
        }
        self.sweep_schedule().map(|_| ())
    }

    pub fn sweep_schedule(&self) -> Result<SweepSchedule> {
        match (&self.sweep.daily_at, self.sweep.every_minutes) {
            (Some(_), Some(_)) => Err(Error::Config(
                "sweep.daily_at and sweep.every_minutes are mutually exclusive".to_string(),
            )),
            (Some(at), None) => daily(at),
            (None, Some(minutes)) => {
                if minutes < 1 {
                    return Err(Error::Config(format!(
                        "sweep.every_minutes must be positive (got {minutes})"
                    )));
                }
                Ok(SweepSchedule::Every {
                    period: Duration::minutes(minutes),
                })
            }
            (None, None) => daily("03:00"),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lease_duration: Duration::minutes(self.lease_minutes),
            near_expiry_horizon: Duration::minutes(self.near_expiry_minutes),
        }
    }
}

fn daily(raw: &str) -> Result<SweepSchedule> {
    let at = NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|e| Error::Config(format!("sweep.daily_at {raw:?} is not HH:MM: {e}")))?;
    Ok(SweepSchedule::Daily { at })
}

fn int_var(name: &str) -> Result<Option<i64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name} must be an integer (got {raw:?})"))),
        Err(_) => Ok(None),
    }
}
