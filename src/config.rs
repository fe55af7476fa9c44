use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct AppConfig {
    pub galvos: GalvoConfig,
    pub counting: CountingConfig,
    pub fast: FastConfig,
    pub logging: LoggingConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GalvoConfig {
    pub xgalvo: String,
    pub ygalvo: String,
    pub bits: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CountingConfig {
    pub pulsechan: String,
    pub countchan: String,
    pub dwell_s: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct FastConfig {
    pub pulsechan: String,
    pub countchan: String,
    pub sampleclk: String,
    pub det_afg: String,
    pub rf_afg: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for GalvoConfig {
    fn default() -> Self {
        Self {
            xgalvo: "Dev2/ao0".to_string(),
            ygalvo: "Dev2/ao1".to_string(),
            bits: 12,
        }
    }
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            pulsechan: "Dev1/ctr1".to_string(),
            countchan: "Dev1/ctr0".to_string(),
            dwell_s: 0.01,
        }
    }
}

impl CountingConfig {
    pub fn dwell(&self) -> Result<Duration, ConfigError> {
        Duration::try_from_secs_f64(self.dwell_s)
            .ok()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| {
                ConfigError::Message(format!("counting.dwell_s must be positive, got {}", self.dwell_s))
            })
    }
}

impl Default for FastConfig {
    fn default() -> Self {
        Self {
            pulsechan: "Dev1/ctr2".to_string(),
            countchan: "Dev1/ctr0".to_string(),
            sampleclk: "PFI34".to_string(),
            det_afg: "GPIB::11".to_string(),
            rf_afg: "GPIB::10".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
        }
    }
}

const CONFIG_FILE_NAME: &str = "rusty_confocal.toml";

/// Config files tried in order when no explicit path is given
fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        paths.push(PathBuf::from(home).join(format!(".{CONFIG_FILE_NAME}")));
    }
    paths
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else if let Some(path) = default_config_paths().into_iter().find(|p| p.exists()) {
        log::debug!("Using config file {}", path.display());
        builder = builder.add_source(File::from(path));
    }

    // Add environment variable overrides with prefix "RUSTY_CONFOCAL_"
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_CONFOCAL")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration with better error handling and defaults
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}

/// Build a configuration from `section.key -> value` pairs over the defaults
///
/// Values are parsed the same way environment overrides are, so `"16"` can
/// fill an integer field.
pub fn from_flat_map(values: &HashMap<String, String>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);
    for (key, value) in values {
        builder = builder.set_override(key.as_str(), parse_value(value))?;
    }
    builder.build()?.try_deserialize::<AppConfig>()
}

fn parse_value(value: &str) -> config::Value {
    if let Ok(i) = value.parse::<i64>() {
        i.into()
    } else if let Ok(f) = value.parse::<f64>() {
        f.into()
    } else if let Ok(b) = value.parse::<bool>() {
        b.into()
    } else {
        value.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.galvos.xgalvo, "Dev2/ao0");
        assert_eq!(config.galvos.bits, 12);
        assert_eq!(config.counting.pulsechan, "Dev1/ctr1");
        assert_eq!(config.counting.dwell().unwrap(), Duration::from_millis(10));
        assert_eq!(config.fast.sampleclk, "PFI34");
        assert_eq!(config.fast.det_afg, "GPIB::11");
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_flat_map_overrides() {
        let mut values = HashMap::new();
        values.insert("galvos.xgalvo".to_string(), "Dev3/ao2".to_string());
        values.insert("galvos.bits".to_string(), "14".to_string());
        values.insert("counting.dwell_s".to_string(), "0.5".to_string());

        let config = from_flat_map(&values).unwrap();
        assert_eq!(config.galvos.xgalvo, "Dev3/ao2");
        assert_eq!(config.galvos.bits, 14);
        assert_eq!(config.counting.dwell().unwrap(), Duration::from_millis(500));
        assert_eq!(config.fast, FastConfig::default());
    }

    #[test]
    fn test_toml_file_layer() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[fast]\nsampleclk = \"PFI12\"\n\n[output]\ndirectory = \"/data/scans\"").unwrap();

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.fast.sampleclk, "PFI12");
        assert_eq!(config.fast.rf_afg, "GPIB::10");
        assert_eq!(config.output.directory, PathBuf::from("/data/scans"));
    }

    #[test]
    fn test_missing_explicit_file() {
        assert!(load_config(Some(Path::new("/nonexistent/rusty_confocal.toml"))).is_err());
        let config = load_config_or_default(Some(Path::new("/nonexistent/rusty_confocal.toml")));
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_zero_dwell_rejected() {
        let counting = CountingConfig {
            dwell_s: 0.0,
            ..CountingConfig::default()
        };
        assert!(counting.dwell().is_err());
    }
}
