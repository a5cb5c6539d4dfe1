use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::audio::features::SectionType;

/// One placement inside a 4-beat bar.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternNote {
    /// Beat offset within the bar, 0.0 <= beat < 4.0
    pub beat: f32,
    pub lane: u8,
    #[serde(default)]
    pub hold: bool,
    /// Hold length in beats; ignored unless `hold`
    #[serde(default)]
    pub hold_beats: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub notes: Vec<PatternNote>,
}

/// On-disk catalog override. Section types missing from `patterns` keep
/// their built-in templates.
#[derive(Debug, Deserialize)]
pub struct CatalogManifest {
    #[serde(default = "default_lanes")]
    pub lanes: u8,
    #[serde(default)]
    pub patterns: HashMap<SectionType, Vec<Pattern>>,
}

pub fn default_lanes() -> u8 { 4 }
