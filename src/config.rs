use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{CaptureSettings, DEFAULT_BATCH_CAPACITY, DEFAULT_DEBOUNCE, DEFAULT_REOPEN_INTERVAL};
use crate::extension::{smtp, upload, ExtensionConfig};
use crate::orchestrator::OrchestratorSettings;
use crate::presence::{MacAddress, TrustedDeviceSet};
use crate::schedule::{ActivationSchedule, PeriodEntry};

const DEFAULT_DEVICE_NAME: &str = "Camera 1";
const DEFAULT_VIDEO_SOURCE: &str = "stub://camera";
const DEFAULT_ANALYZER: &str = "difference";
const DEFAULT_CAPTURE_DELAY_MS: u64 = 200;
const DEFAULT_NOTIFICATION_DELAY_SECS: u64 = 5;
const MAX_NOTIFICATION_DELAY_SECS: u64 = 3600;
const DEFAULT_ACTIVATION_CHECK_SECS: u64 = 60;
const DEFAULT_PRESENCE_CHECK_SECS: u64 = 120;
const DEFAULT_SPOOL_DIR_NAME: &str = "motion_gate";
const KNOWN_EXTENSIONS: &[&str] = &[smtp::KIND, upload::KIND];
const KNOWN_ANALYZERS: &[&str] = &["difference", "hash"];

#[derive(Debug, Deserialize, Default)]
struct MotionConfigFile {
    device_name: Option<String>,
    video_source: Option<String>,
    analyzer: Option<String>,
    capture_delay_ms: Option<u64>,
    notification_delay_secs: Option<u64>,
    activation_check_secs: Option<u64>,
    presence_check_secs: Option<u64>,
    activation_periods: Option<Vec<PeriodEntry>>,
    mac_addresses: Option<BTreeMap<String, String>>,
    spool_dir: Option<PathBuf>,
    extensions: Option<BTreeMap<String, ExtensionConfig>>,
}

#[derive(Debug, Clone)]
pub struct MotionConfig {
    pub device_name: String,
    pub video_source: String,
    pub analyzer: String,
    pub capture_delay: Duration,
    pub notification_delay: Duration,
    pub activation_check: Duration,
    pub presence_check: Duration,
    pub schedule: ActivationSchedule,
    pub trusted: TrustedDeviceSet,
    pub spool_dir: PathBuf,
    pub extensions: BTreeMap<String, ExtensionConfig>,
}

impl MotionConfig {
    /// Load from the file named by `MOTION_CONFIG` (if any), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("MOTION_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MotionConfigFile) -> Result<Self> {
        let schedule = match file.activation_periods {
            Some(entries) => ActivationSchedule::from_entries(&entries)
                .map_err(|e| anyhow!("invalid activation_periods: {:#}", e))?,
            None => ActivationSchedule::always(),
        };
        let trusted = TrustedDeviceSet::from_labels(file.mac_addresses.unwrap_or_default())
            .map_err(|e| anyhow!("invalid mac_addresses: {:#}", e))?;
        Ok(Self {
            device_name: file
                .device_name
                .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string()),
            video_source: file
                .video_source
                .unwrap_or_else(|| DEFAULT_VIDEO_SOURCE.to_string()),
            analyzer: file
                .analyzer
                .unwrap_or_else(|| DEFAULT_ANALYZER.to_string()),
            capture_delay: Duration::from_millis(
                file.capture_delay_ms.unwrap_or(DEFAULT_CAPTURE_DELAY_MS),
            ),
            notification_delay: Duration::from_secs(
                file.notification_delay_secs
                    .unwrap_or(DEFAULT_NOTIFICATION_DELAY_SECS),
            ),
            activation_check: Duration::from_secs(
                file.activation_check_secs
                    .unwrap_or(DEFAULT_ACTIVATION_CHECK_SECS),
            ),
            presence_check: Duration::from_secs(
                file.presence_check_secs
                    .unwrap_or(DEFAULT_PRESENCE_CHECK_SECS),
            ),
            schedule,
            trusted,
            spool_dir: file
                .spool_dir
                .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SPOOL_DIR_NAME)),
            extensions: file.extensions.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(name) = std::env::var("MOTION_DEVICE_NAME") {
            if !name.trim().is_empty() {
                self.device_name = name;
            }
        }
        if let Ok(source) = std::env::var("MOTION_VIDEO_SOURCE") {
            if !source.trim().is_empty() {
                self.video_source = source;
            }
        }
        if let Ok(delay) = std::env::var("MOTION_NOTIFICATION_DELAY_SECS") {
            let seconds: u64 = delay.trim().parse().map_err(|_| {
                anyhow!("MOTION_NOTIFICATION_DELAY_SECS must be an integer number of seconds")
            })?;
            self.notification_delay = Duration::from_secs(seconds);
        }
        if let Ok(macs) = std::env::var("MOTION_TRUSTED_MACS") {
            let parsed = split_csv(&macs);
            if !parsed.is_empty() {
                let mut trusted = TrustedDeviceSet::new();
                for mac in parsed {
                    let mac = MacAddress::parse(&mac)
                        .map_err(|e| anyhow!("invalid MOTION_TRUSTED_MACS: {:#}", e))?;
                    trusted.insert(mac, None);
                }
                self.trusted = trusted;
            }
        }
        if let Ok(dir) = std::env::var("MOTION_SPOOL_DIR") {
            if !dir.trim().is_empty() {
                self.spool_dir = PathBuf::from(dir);
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.device_name = self.device_name.trim().to_string();
        if self.device_name.is_empty() {
            return Err(anyhow!("device_name must not be empty"));
        }
        if self.notification_delay.as_secs() > MAX_NOTIFICATION_DELAY_SECS {
            return Err(anyhow!(
                "notification delay must be between 0 and {} seconds",
                MAX_NOTIFICATION_DELAY_SECS
            ));
        }
        if self.capture_delay.is_zero() {
            return Err(anyhow!("capture_delay_ms must be greater than zero"));
        }
        if self.activation_check.is_zero() || self.presence_check.is_zero() {
            return Err(anyhow!("check periods must be greater than zero"));
        }
        if !KNOWN_ANALYZERS.contains(&self.analyzer.as_str()) {
            return Err(anyhow!(
                "unknown analyzer '{}' (expected one of {:?})",
                self.analyzer,
                KNOWN_ANALYZERS
            ));
        }
        if let Some(unknown) = self
            .extensions
            .keys()
            .find(|kind| !KNOWN_EXTENSIONS.contains(&kind.as_str()))
        {
            return Err(anyhow!("unknown extension '{}'", unknown));
        }
        Ok(())
    }

    /// Extension config by kind; unconfigured extensions are disabled.
    pub fn extension(&self, kind: &str) -> ExtensionConfig {
        self.extensions.get(kind).cloned().unwrap_or_default()
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            schedule: self.schedule.clone(),
            trusted: self.trusted.clone(),
            capture: CaptureSettings {
                device_name: self.device_name.clone(),
                capture_delay: self.capture_delay,
                notification_delay: self.notification_delay,
                debounce: DEFAULT_DEBOUNCE,
                batch_capacity: DEFAULT_BATCH_CAPACITY,
                reopen_interval: DEFAULT_REOPEN_INTERVAL,
            },
            activation_period: self.activation_check,
            presence_period: self.presence_check,
        }
    }
}

fn read_config_file(path: &Path) -> Result<MotionConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
