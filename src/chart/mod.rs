pub mod builder;

use serde::{Deserialize, Serialize};

pub use builder::{build_chart, ChartData};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Normal,
    Hard,
    Expert,
}

impl Difficulty {
    /// Share of template notes kept in a full-intensity section.
    pub fn density(self) -> f32 {
        match self {
            Difficulty::Easy => 0.35,
            Difficulty::Normal => 0.55,
            Difficulty::Hard => 0.8,
            Difficulty::Expert => 1.0,
        }
    }

    /// Onsets per second the sensitivity sweep aims for.
    pub fn target_onset_rate(self) -> f32 {
        match self {
            Difficulty::Easy => 1.5,
            Difficulty::Normal => 2.5,
            Difficulty::Hard => 3.5,
            Difficulty::Expert => 5.0,
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Difficulty::Easy => "easy",
            Difficulty::Normal => "normal",
            Difficulty::Hard => "hard",
            Difficulty::Expert => "expert",
        };
        f.write_str(name)
    }
}
