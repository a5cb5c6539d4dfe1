use std::collections::BTreeMap;
use std::path::Path;

use super::embedded::embedded_patterns;
use super::manifest::{default_lanes, CatalogManifest, Pattern};
use crate::audio::features::SectionType;
use crate::error::{AnalysisError, Result};

const BAR_BEATS: f32 = 4.0;
/// Knuth's multiplicative hash constant (2^32 / phi)
const KNUTH: u32 = 2_654_435_761;

/// Lane-placement templates keyed by section type.
#[derive(Clone, Debug)]
pub struct PatternCatalog {
    lanes: u8,
    patterns: BTreeMap<SectionType, Vec<Pattern>>,
}

impl PatternCatalog {
    /// The catalog compiled into the binary.
    pub fn builtin() -> Result<Self> {
        let mut patterns = BTreeMap::new();
        for (kind, json) in embedded_patterns() {
            let list: Vec<Pattern> = serde_json::from_str(json)?;
            patterns.insert(*kind, list);
        }
        let catalog = Self {
            lanes: default_lanes(),
            patterns,
        };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Built-in catalog with the section types present in `path` replaced.
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let manifest: CatalogManifest = serde_json::from_str(&json)?;

        let mut catalog = Self::builtin()?;
        catalog.lanes = manifest.lanes;
        for (kind, list) in manifest.patterns {
            log::debug!("Overriding {} templates for {}", list.len(), kind.name());
            catalog.patterns.insert(kind, list);
        }
        catalog.validate()?;
        log::info!("Loaded pattern catalog: {}", path.display());
        Ok(catalog)
    }

    pub fn lanes(&self) -> u8 {
        self.lanes
    }

    pub fn patterns(&self, kind: SectionType) -> &[Pattern] {
        self.patterns.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Deterministic template for the `index`-th bar of a section type.
    ///
    /// Consecutive indices never share a template when the type has more
    /// than one.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn select_pattern(&self, kind: SectionType, index: usize) -> Option<&Pattern> {
        let mut selected = None;
        for i in 0..=index {
            selected = Some(self.next_pattern(kind, i, selected.map(|(slot, _)| slot))?);
        }
        selected.map(|(_, pattern)| pattern)
    }

    /// One step of `select_pattern`, given the slot chosen for `index - 1`.
    /// Returns the slot to pass on with the template.
    pub fn next_pattern(
        &self,
        kind: SectionType,
        index: usize,
        previous: Option<usize>,
    ) -> Option<(usize, &Pattern)> {
        let list = self.patterns(kind);
        let slot = select_index(list.len(), index, previous)?;
        Some((slot, &list[slot]))
    }

    fn validate(&self) -> Result<()> {
        if self.lanes == 0 {
            return Err(AnalysisError::Pattern("catalog needs at least one lane".into()));
        }
        for kind in SectionType::ALL {
            let list = self.patterns(kind);
            if list.is_empty() {
                return Err(AnalysisError::Pattern(format!(
                    "no templates for section type '{}'",
                    kind.name()
                )));
            }
            for pattern in list {
                for note in &pattern.notes {
                    if note.lane >= self.lanes {
                        return Err(AnalysisError::Pattern(format!(
                            "'{}': lane {} out of range for {} lanes",
                            pattern.name, note.lane, self.lanes
                        )));
                    }
                    if !(0.0..BAR_BEATS).contains(&note.beat) {
                        return Err(AnalysisError::Pattern(format!(
                            "'{}': beat {} outside the bar",
                            pattern.name, note.beat
                        )));
                    }
                    if note.hold && !(note.hold_beats > 0.0) {
                        return Err(AnalysisError::Pattern(format!(
                            "'{}': hold at beat {} has no length",
                            pattern.name, note.beat
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Hashed slot for `index`, rotated forward when it repeats `previous`.
fn select_index(count: usize, index: usize, previous: Option<usize>) -> Option<usize> {
    if count == 0 {
        return None;
    }
    let hashed = ((index as u32).wrapping_mul(KNUTH) >> 16) as usize % count;
    if count > 1 && previous == Some(hashed) {
        Some((hashed + 1) % count)
    } else {
        Some(hashed)
    }
}

/// Template names per section type, in section order.
pub fn list_patterns(catalog: &PatternCatalog) -> Vec<(SectionType, Vec<String>)> {
    SectionType::ALL
        .iter()
        .map(|&kind| {
            let names = catalog.patterns(kind).iter().map(|p| p.name.clone()).collect();
            (kind, names)
        })
        .collect()
}
