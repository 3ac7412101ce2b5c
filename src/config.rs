use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_ENV: &str = "SIGNAGE_CONFIG";

/// Engine timing. Every field has the player's stock value as default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub smart_poll_ms: u64,
    pub expedited_poll_ms: u64,
    pub fullscreen_backoff_ms: u64,
    pub start_step_ms: u64,
    pub initial_start_delay_ms: u64,
    pub placeholder_start_delay_ms: u64,
    pub placeholder_idle_ms: u64,
    pub skip_delay_ms: u64,
    pub status_interval_ms: u64,
    pub stream_poll_ms: u64,
    pub stream_end_grace_ms: u64,
    pub flash_poll_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            smart_poll_ms: 2000,
            expedited_poll_ms: 10,
            fullscreen_backoff_ms: 1000,
            start_step_ms: 50,
            initial_start_delay_ms: 10,
            placeholder_start_delay_ms: 700,
            placeholder_idle_ms: 20,
            skip_delay_ms: 100,
            status_interval_ms: 10_000,
            stream_poll_ms: 200,
            stream_end_grace_ms: 5123,
            flash_poll_ms: 400,
        }
    }
}

/// Timers that re-arm themselves need a non-zero period.
fn interval(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

impl EngineSettings {
    /// Reject intervals of zero. Only the two start delays may be zero.
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("smart_poll_ms", self.smart_poll_ms),
            ("expedited_poll_ms", self.expedited_poll_ms),
            ("fullscreen_backoff_ms", self.fullscreen_backoff_ms),
            ("start_step_ms", self.start_step_ms),
            ("placeholder_idle_ms", self.placeholder_idle_ms),
            ("skip_delay_ms", self.skip_delay_ms),
            ("status_interval_ms", self.status_interval_ms),
            ("stream_poll_ms", self.stream_poll_ms),
            ("stream_end_grace_ms", self.stream_end_grace_ms),
            ("flash_poll_ms", self.flash_poll_ms),
        ];
        match intervals.iter().find(|(_, ms)| *ms == 0) {
            Some((name, _)) => Err(Error::Config(format!("engine.{} must be at least 1", name))),
            None => Ok(()),
        }
    }

    pub fn smart_poll(&self) -> Duration {
        interval(self.smart_poll_ms)
    }

    pub fn expedited_poll(&self) -> Duration {
        interval(self.expedited_poll_ms)
    }

    pub fn fullscreen_backoff(&self) -> Duration {
        interval(self.fullscreen_backoff_ms)
    }

    pub fn start_step(&self) -> Duration {
        interval(self.start_step_ms)
    }

    pub fn placeholder_idle(&self) -> Duration {
        interval(self.placeholder_idle_ms)
    }

    pub fn skip_delay(&self) -> Duration {
        interval(self.skip_delay_ms)
    }

    pub fn status_interval(&self) -> Duration {
        interval(self.status_interval_ms)
    }

    pub fn stream_poll(&self) -> Duration {
        interval(self.stream_poll_ms)
    }

    pub fn stream_end_grace(&self) -> Duration {
        interval(self.stream_end_grace_ms)
    }

    pub fn flash_poll(&self) -> Duration {
        interval(self.flash_poll_ms)
    }
}

/// Flat key/value parameters. Keys are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>")]
pub struct Parameters(BTreeMap<String, String>);

impl From<BTreeMap<String, String>> for Parameters {
    fn from(map: BTreeMap<String, String>) -> Self {
        Parameters(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        )
    }
}

impl Parameters {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_lowercase(), value.into());
    }

    /// Program-wide placeholder activation limit. None when absent or not a
    /// number.
    pub fn placeholder_limit(&self) -> Option<u32> {
        self.get("placeholderlimit")?.trim().parse().ok()
    }

    /// Name of the program to play.
    pub fn program(&self) -> Option<&str> {
        self.get("program")
    }
}

/// Contents of `player.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub parameters: Parameters,
    /// Where to keep the latest status snapshot as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
    /// Directory holding `localcontent/<slot>/description.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_root: Option<PathBuf>,
}

impl PlayerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PlayerConfig = toml::from_str(s)?;
        config.engine.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Locate the config file: explicit path, then `SIGNAGE_CONFIG`, then
    /// `<config dir>/signage/player.toml` if it exists.
    pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        let default = dirs::config_dir()?.join("signage").join("player.toml");
        default.exists().then_some(default)
    }

    /// Load from the resolved path, or fall back to defaults when there is
    /// no config file anywhere.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        match Self::resolve_path(explicit) {
            Some(path) => {
                debug!(path = %path.display(), "loading config");
                Self::load(&path)
            }
            None => {
                debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_player() {
        let cfg = PlayerConfig::default();
        assert_eq!(cfg.engine.smart_poll(), Duration::from_secs(2));
        assert_eq!(cfg.engine.expedited_poll(), Duration::from_millis(10));
        assert_eq!(cfg.engine.stream_end_grace(), Duration::from_millis(5123));
        assert!(cfg.parameters.placeholder_limit().is_none());
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let cfg = PlayerConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, PlayerConfig::default());
    }

    #[test]
    fn partial_engine_section_keeps_other_defaults() {
        let cfg = PlayerConfig::from_toml_str("[engine]\nsmart_poll_ms = 500\n").unwrap();
        assert_eq!(cfg.engine.smart_poll_ms, 500);
        assert_eq!(cfg.engine.fullscreen_backoff_ms, 1000);
    }

    #[test]
    fn parameter_keys_are_case_insensitive() {
        let cfg = PlayerConfig::from_toml_str(
            "[parameters]\nPlaceHolderLimit = \"3\"\nProgram = \"lobby\"\n",
        )
        .unwrap();
        assert_eq!(cfg.parameters.placeholder_limit(), Some(3));
        assert_eq!(cfg.parameters.get("PROGRAM"), Some("lobby"));
        assert_eq!(cfg.parameters.program(), Some("lobby"));
    }

    #[test]
    fn unparsable_limit_is_absent() {
        let mut params = Parameters::default();
        params.set("placeholderlimit", "many");
        assert!(params.placeholder_limit().is_none());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(matches!(
            PlayerConfig::from_toml_str("[engine\n"),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = PlayerConfig::from_toml_str("[engine]\nstart_step_ms = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("start_step_ms")));
        assert!(PlayerConfig::from_toml_str("[engine]\nstatus_interval_ms = 0\n").is_err());
        // Start delays may be zero.
        assert!(PlayerConfig::from_toml_str("[engine]\ninitial_start_delay_ms = 0\n").is_ok());
    }

    #[test]
    fn zero_interval_set_in_code_still_advances() {
        let mut engine = EngineSettings::default();
        engine.start_step_ms = 0;
        engine.smart_poll_ms = 0;
        assert_eq!(engine.start_step(), Duration::from_millis(1));
        assert_eq!(engine.smart_poll(), Duration::from_millis(1));
    }

    #[test]
    fn load_reads_file_and_explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("player.toml");
        fs::write(&path, "status_file = \"/tmp/status.json\"\n").unwrap();
        assert_eq!(PlayerConfig::resolve_path(Some(&path)), Some(path.clone()));
        let cfg = PlayerConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(cfg.status_file, Some(PathBuf::from("/tmp/status.json")));
    }

    #[test]
    fn missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(PlayerConfig::load(&path), Err(Error::Config(_))));
    }
}
