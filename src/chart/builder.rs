//! Note placement from section labels, onsets and the pattern catalog.
//!
//! Each section is walked bar by bar on the beat grid. A template note is
//! kept when nearby onsets support it strongly enough for the section's
//! density; busier sections and harder difficulties need less support.

use serde::Serialize;

use super::Difficulty;
use crate::audio::analysis::TrackAnalysis;
use crate::audio::features::{OnsetEvent, SectionInfo, SectionType, SpectralProfile};
use crate::patterns::PatternCatalog;

const FORMAT_VERSION: u32 = 1;
const BAR_BEATS: f32 = 4.0;
/// Onsets this close to a note count as support.
const SUPPORT_WINDOW: f32 = 0.07;
const HOLD_MIN_TONAL: f32 = 0.35;
/// Holds clipped below this many beats become taps.
const HOLD_MIN_BEATS: f32 = 0.5;
const SAME_LANE_GAP: f32 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartNote {
    pub time: f32,
    pub lane: u8,
    /// Hold length in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hold: Option<f32>,
    pub section: SectionType,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub version: u32,
    pub difficulty: Difficulty,
    pub lanes: u8,
    pub bpm: f32,
    pub beat_confidence: f32,
    pub first_beat_offset: f32,
    pub duration: f32,
    pub sections: Vec<SectionInfo>,
    pub notes: Vec<ChartNote>,
}

fn section_multiplier(kind: SectionType) -> f32 {
    match kind {
        SectionType::Intro => 0.4,
        SectionType::Verse => 0.8,
        SectionType::Chorus => 1.0,
        SectionType::Drop => 1.15,
        SectionType::Bridge => 0.6,
        SectionType::Interlude => 0.25,
        SectionType::Outro => 0.4,
    }
}

/// Strongest onset within the support window of `time`. `onsets` is sorted.
fn onset_support(onsets: &[OnsetEvent], time: f32) -> f32 {
    let lo = onsets.partition_point(|o| o.time < time - SUPPORT_WINDOW);
    onsets[lo..]
        .iter()
        .take_while(|o| o.time <= time + SUPPORT_WINDOW)
        .map(|o| o.strength)
        .fold(0.0, f32::max)
}

/// Tonal score of the profile point nearest to `time`. `spectral` is sorted.
fn tonal_at(spectral: &[SpectralProfile], time: f32) -> f32 {
    let idx = spectral.partition_point(|p| p.time < time);
    [idx.checked_sub(1), Some(idx)]
        .into_iter()
        .flatten()
        .filter_map(|i| spectral.get(i))
        .min_by(|a, b| (a.time - time).abs().total_cmp(&(b.time - time).abs()))
        .map_or(0.0, |p| p.tonal)
}

pub fn build_chart(
    analysis: &TrackAnalysis,
    catalog: &PatternCatalog,
    difficulty: Difficulty,
) -> ChartData {
    let beat = &analysis.beat;
    let interval = beat.beat_interval;
    let bar = BAR_BEATS * interval;
    let offset = beat.first_beat_offset.max(0.0);
    let lanes = catalog.lanes();

    let mut notes: Vec<ChartNote> = Vec::new();
    // Time each lane becomes free again
    let mut lane_free = vec![f32::NEG_INFINITY; lanes as usize];
    let mut bars_seen = [0usize; SectionType::ALL.len()];
    let mut last_slot: [Option<usize>; SectionType::ALL.len()] = [None; SectionType::ALL.len()];

    if interval.is_finite() && interval > 0.0 {
        for section in &analysis.sections {
            let p = (difficulty.density() * section_multiplier(section.kind)).clamp(0.0, 1.0);
            let on_beat_need = 0.2 * (1.0 - p);
            let off_beat_need = 0.5 * (1.0 - p) + 0.1;

            // First bar that reaches into the section
            let first = ((section.start - offset) / bar).floor().max(0.0) as usize;
            let slot = section.kind as usize;
            let mut bar_start = offset + first as f32 * bar;

            while bar_start < section.end {
                let index = bars_seen[slot];
                bars_seen[slot] += 1;
                let Some((chosen, pattern)) =
                    catalog.next_pattern(section.kind, index, last_slot[slot])
                else {
                    break;
                };
                last_slot[slot] = Some(chosen);

                for note in &pattern.notes {
                    let time = bar_start + note.beat * interval;
                    if time < section.start || time >= section.end || time >= analysis.duration {
                        continue;
                    }
                    let lane = note.lane as usize;
                    if time < lane_free[lane] {
                        continue;
                    }

                    let on_beat = (note.beat - note.beat.round()).abs() < 1e-3;
                    let need = if on_beat { on_beat_need } else { off_beat_need };
                    if need > 0.0 && onset_support(&analysis.onsets, time) < need {
                        continue;
                    }

                    let hold = if note.hold && tonal_at(&analysis.spectral, time) >= HOLD_MIN_TONAL {
                        let len = (note.hold_beats * interval).min(section.end - time);
                        (len >= HOLD_MIN_BEATS * interval).then_some(len)
                    } else {
                        None
                    };

                    lane_free[lane] = time + hold.unwrap_or(SAME_LANE_GAP);
                    notes.push(ChartNote {
                        time,
                        lane: note.lane,
                        hold,
                        section: section.kind,
                    });
                }
                bar_start += bar;
            }
        }
    }

    notes.sort_by(|a, b| a.time.total_cmp(&b.time).then(a.lane.cmp(&b.lane)));
    log::info!(
        "Chart ({}): {} notes, {} holds over {} sections",
        difficulty,
        notes.len(),
        notes.iter().filter(|n| n.hold.is_some()).count(),
        analysis.sections.len()
    );

    ChartData {
        version: FORMAT_VERSION,
        difficulty,
        lanes,
        bpm: beat.bpm,
        beat_confidence: beat.confidence,
        first_beat_offset: offset,
        duration: analysis.duration,
        sections: analysis.sections.clone(),
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::{BeatEstimate, BeatSource};

    fn section(start: f32, end: f32, kind: SectionType) -> SectionInfo {
        SectionInfo {
            start,
            end,
            kind,
            avg_energy: 0.5,
            interlude: kind == SectionType::Interlude,
        }
    }

    /// 120 BPM, evenly spaced onsets, flat tonal score.
    fn analysis_with(
        sections: Vec<SectionInfo>,
        onset_step: f32,
        onset_strength: f32,
        tonal: f32,
    ) -> TrackAnalysis {
        let duration = sections.last().map_or(0.0, |s| s.end);
        let onsets = (0..(duration / onset_step) as usize)
            .map(|i| OnsetEvent {
                time: i as f32 * onset_step,
                strength: onset_strength,
                band: None,
            })
            .collect();
        let spectral = (0..(duration * 2.0) as usize)
            .map(|i| SpectralProfile {
                time: i as f32 * 0.5,
                tonal,
                ..Default::default()
            })
            .collect();
        TrackAnalysis {
            duration,
            sample_rate: 44100,
            beat: BeatEstimate::new(120.0, 0.9, 0.0, BeatSource::Autocorrelation),
            sensitivity: 1.0,
            onsets: if onset_strength > 0.0 { onsets } else { Vec::new() },
            sections,
            spectral,
        }
    }

    /// Onsets on every beat.
    fn analysis(sections: Vec<SectionInfo>, onset_strength: f32, tonal: f32) -> TrackAnalysis {
        analysis_with(sections, 0.5, onset_strength, tonal)
    }

    fn assert_playable(chart: &ChartData) {
        assert!(chart.notes.windows(2).all(|w| w[0].time <= w[1].time));
        for (i, note) in chart.notes.iter().enumerate() {
            assert!(note.lane < chart.lanes);
            assert!(note.time >= 0.0 && note.time < chart.duration);
            let owner = chart
                .sections
                .iter()
                .find(|s| note.time >= s.start && note.time < s.end)
                .unwrap();
            assert_eq!(owner.kind, note.section);
            if let Some(len) = note.hold {
                assert!(note.time + len <= owner.end + 1e-4);
                // Nothing else starts in this lane while the hold is active
                assert!(chart.notes[i + 1..]
                    .iter()
                    .filter(|n| n.lane == note.lane)
                    .all(|n| n.time >= note.time + len));
            }
        }
    }

    #[test]
    fn supported_chart_is_playable() {
        let catalog = PatternCatalog::builtin().unwrap();
        let a = analysis(
            vec![
                section(0.0, 8.0, SectionType::Intro),
                section(8.0, 21.0, SectionType::Verse),
                section(21.0, 37.0, SectionType::Drop),
                section(37.0, 42.0, SectionType::Outro),
            ],
            0.9,
            0.6,
        );
        for difficulty in [Difficulty::Easy, Difficulty::Normal, Difficulty::Hard, Difficulty::Expert] {
            let chart = build_chart(&a, &catalog, difficulty);
            assert!(!chart.notes.is_empty());
            assert_playable(&chart);
        }
    }

    #[test]
    fn harder_difficulties_keep_more_notes() {
        let catalog = PatternCatalog::builtin().unwrap();
        let a = analysis_with(vec![section(0.0, 32.0, SectionType::Drop)], 0.25, 0.3, 0.6);
        let easy = build_chart(&a, &catalog, Difficulty::Easy).notes.len();
        let expert = build_chart(&a, &catalog, Difficulty::Expert).notes.len();
        // Easy drop: off-beat notes need ~0.4 support, on-beat ~0.12
        assert!(easy > 0);
        assert!(expert > easy, "expert {} easy {}", expert, easy);
    }

    #[test]
    fn unsupported_track_keeps_only_full_density_downbeats() {
        let catalog = PatternCatalog::builtin().unwrap();
        let a = analysis(
            vec![
                section(0.0, 16.0, SectionType::Verse),
                section(16.0, 32.0, SectionType::Chorus),
            ],
            0.0,
            0.6,
        );
        let chart = build_chart(&a, &catalog, Difficulty::Expert);
        assert!(!chart.notes.is_empty());
        for note in &chart.notes {
            assert_eq!(note.section, SectionType::Chorus);
            let beats = note.time / 0.5;
            assert!((beats - beats.round()).abs() < 1e-3, "off-beat note at {}", note.time);
        }
        assert!(build_chart(&a, &catalog, Difficulty::Hard).notes.is_empty());
    }

    #[test]
    fn holds_need_tonal_material() {
        let catalog = PatternCatalog::builtin().unwrap();
        let sections = vec![section(0.0, 40.0, SectionType::Bridge)];
        let flat = build_chart(&analysis(sections.clone(), 0.9, 0.1), &catalog, Difficulty::Expert);
        assert!(flat.notes.iter().all(|n| n.hold.is_none()));

        let tonal = build_chart(&analysis(sections, 0.9, 0.8), &catalog, Difficulty::Expert);
        assert!(tonal.notes.iter().any(|n| n.hold.is_some()));
        assert_playable(&tonal);
    }

    #[test]
    fn holds_are_clipped_at_section_end() {
        let catalog = PatternCatalog::builtin().unwrap();
        // The second bridge bar uses the 3-beat hold; its section leaves 2 beats
        let a = analysis(
            vec![
                section(0.0, 2.0, SectionType::Bridge),
                section(2.0, 4.0, SectionType::Chorus),
                section(4.0, 5.0, SectionType::Bridge),
                section(5.0, 8.0, SectionType::Chorus),
            ],
            0.9,
            0.8,
        );
        let chart = build_chart(&a, &catalog, Difficulty::Expert);
        assert_playable(&chart);
        let held = chart.notes.iter().find(|n| n.time == 4.0 && n.lane == 2).unwrap();
        assert_eq!(held.hold, Some(1.0));
    }

    #[test]
    fn invalid_tempo_yields_no_notes() {
        let catalog = PatternCatalog::builtin().unwrap();
        let mut a = analysis(vec![section(0.0, 10.0, SectionType::Drop)], 0.9, 0.5);
        a.beat.beat_interval = f32::NAN;
        let chart = build_chart(&a, &catalog, Difficulty::Expert);
        assert!(chart.notes.is_empty());
        assert_eq!(chart.sections.len(), 1);
    }
}
