use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::audio::analysis::AnalysisSettings;
use crate::chart::Difficulty;
use crate::hint::DEFAULT_HINT_BUDGET;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub chart: ChartConfig,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisConfig {
    #[serde(flatten)]
    pub settings: AnalysisSettings,
    #[serde(default = "default_hint_timeout_ms")]
    pub hint_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct ChartConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub patterns: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            settings: AnalysisSettings::default(),
            hint_timeout_ms: default_hint_timeout_ms(),
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            patterns: None,
        }
    }
}

fn default_hint_timeout_ms() -> u64 { DEFAULT_HINT_BUDGET.as_millis() as u64 }
fn default_difficulty() -> Difficulty { Difficulty::Normal }

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    let config: Config = match toml::from_str(&content) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("Ignoring malformed config {}: {}", path.display(), e);
            return None;
        }
    };
    if let Err(e) = config.analysis.settings.validate() {
        log::warn!("Ignoring config {}: {}", path.display(), e);
        return None;
    }
    Some(config)
}
