//! Structural sections from a coarse energy timeline.
//!
//! The output always covers `[0, duration)` with contiguous, non-overlapping
//! sections; the repair passes only relabel, they never move boundaries.

use serde::Deserialize;

use super::context::AnalysisContext;
use super::features::{EnergySample, SectionInfo, SectionType, Waveform};

const SMOOTH_RADIUS: usize = 2;
const MIN_JUMP: f32 = 0.15;
const REVERSAL_BONUS: f32 = 0.02;
const LOW_DYNAMIC_RANGE: f32 = 0.25;
const INTERLUDE_FLOOR: f32 = 0.12;
const MIN_PLAYABLE_SHARE: f32 = 0.45;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct StructureConfig {
    /// 0.0 (lenient) to 1.0 (strict) interlude detection
    #[serde(default = "default_interlude_strictness")]
    pub interlude_strictness: f32,
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            interlude_strictness: default_interlude_strictness(),
        }
    }
}

fn default_interlude_strictness() -> f32 { 0.5 }

/// Smoothed, percentile-normalized energy per segment.
#[derive(Clone, Debug)]
pub struct EnergyTimeline {
    pub samples: Vec<EnergySample>,
    /// Segment length, seconds
    pub segment: f32,
    /// `(p90 - p10) / p90` of the smoothed raw energy
    pub dynamic_range: f32,
}

struct Gates {
    p20: f32,
    p50: f32,
    p75: f32,
    p88: f32,
    mean: f32,
    low_dynamic: bool,
}

pub fn segment_length(duration: f32) -> f32 {
    if duration < 60.0 {
        0.5
    } else if duration < 180.0 {
        0.75
    } else {
        1.0
    }
}

pub fn energy_timeline(mono: &[f32], sample_rate: u32, duration: f32) -> EnergyTimeline {
    let segment = segment_length(duration);
    let seg_samples = ((segment * sample_rate as f32) as usize).max(1);

    let raw: Vec<f32> = mono
        .chunks(seg_samples)
        .map(|chunk| (chunk.iter().map(|s| s * s).sum::<f32>() / chunk.len() as f32).sqrt())
        .collect();
    let smoothed = smooth(&raw, SMOOTH_RADIUS);

    let p10 = percentile(&smoothed, 0.10);
    let p90 = percentile(&smoothed, 0.90);
    let dynamic_range = if p90 > 1e-9 { (p90 - p10) / p90 } else { 0.0 };
    // Never stretch less than half of p90 so quiet wobble stays small
    let span = (p90 - p10).max(0.5 * p90).max(1e-9);

    let samples = smoothed
        .iter()
        .enumerate()
        .map(|(i, &v)| EnergySample {
            time: i as f32 * segment,
            energy: ((v - p10) / span).clamp(0.0, 1.0),
        })
        .collect();

    EnergyTimeline {
        samples,
        segment,
        dynamic_range,
    }
}

/// Inverse-distance weighted local average.
fn smooth(values: &[f32], radius: usize) -> Vec<f32> {
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(values.len());
            let (mut sum, mut weight) = (0.0f32, 0.0f32);
            for (j, &v) in values.iter().enumerate().take(hi).skip(lo) {
                let w = 1.0 / (1.0 + i.abs_diff(j) as f32);
                sum += v * w;
                weight += w;
            }
            sum / weight
        })
        .collect()
}

/// Linear-interpolated percentile, `p` in 0.0-1.0.
fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32)
}

/// Labelled sections for a whole waveform.
pub fn detect_structure(
    ctx: &mut AnalysisContext,
    waveform: &Waveform,
    config: &StructureConfig,
) -> Vec<SectionInfo> {
    let mono = ctx.mono_of(waveform);
    let timeline = energy_timeline(&mono, waveform.sample_rate, waveform.duration);
    detect_sections(&timeline, waveform.duration, config)
}

pub fn detect_sections(
    timeline: &EnergyTimeline,
    duration: f32,
    config: &StructureConfig,
) -> Vec<SectionInfo> {
    if !(duration > 0.0) {
        return Vec::new();
    }
    let energies: Vec<f32> = timeline.samples.iter().map(|s| s.energy).collect();
    if energies.len() < 2 {
        let avg = energies.first().copied().unwrap_or(0.0);
        return vec![section(0.0, duration, SectionType::Verse, avg)];
    }

    let gates = Gates {
        p20: percentile(&energies, 0.20),
        p50: percentile(&energies, 0.50),
        p75: percentile(&energies, 0.75),
        p88: percentile(&energies, 0.88),
        mean: energies.iter().sum::<f32>() / energies.len() as f32,
        low_dynamic: timeline.dynamic_range < LOW_DYNAMIC_RANGE,
    };

    let min_spacing = (duration * 0.02).clamp(2.6, 4.4);
    let boundaries = find_boundaries(&timeline.samples, duration, min_spacing);

    let mut edges = Vec::with_capacity(boundaries.len() + 2);
    edges.push(0.0);
    edges.extend(boundaries);
    edges.push(duration);

    let mut sections: Vec<SectionInfo> = edges
        .windows(2)
        .map(|w| {
            let avg = average_energy(&timeline.samples, w[0], w[1]);
            section(w[0], w[1], classify(avg, &gates), avg)
        })
        .collect();

    label_edges(&mut sections, &gates);
    mark_interludes(&mut sections, &gates, duration, config);
    demote_implausible(&mut sections, &gates, duration);
    protect_playable(&mut sections, duration);

    log::debug!(
        "Structure: {}",
        sections
            .iter()
            .map(|s| format!("{}@{:.1}", s.kind.name(), s.start))
            .collect::<Vec<_>>()
            .join(" ")
    );
    sections
}

fn section(start: f32, end: f32, kind: SectionType, avg_energy: f32) -> SectionInfo {
    SectionInfo {
        start,
        end,
        kind,
        avg_energy,
        interlude: kind == SectionType::Interlude,
    }
}

fn relabel(s: &mut SectionInfo, kind: SectionType) {
    s.kind = kind;
    s.interlude = kind == SectionType::Interlude;
}

fn find_boundaries(samples: &[EnergySample], duration: f32, min_spacing: f32) -> Vec<f32> {
    let n = samples.len();
    let mut change = vec![0.0f32; n];
    for i in 1..n {
        let delta = samples[i].energy - samples[i - 1].energy;
        change[i] = delta.abs();
        if i >= 2 && delta * (samples[i - 1].energy - samples[i - 2].energy) < 0.0 {
            change[i] += REVERSAL_BONUS;
        }
    }

    let mean = change[1..].iter().sum::<f32>() / (n - 1) as f32;
    let max = change[1..].iter().copied().fold(0.0f32, f32::max);
    let threshold = (mean * 1.6 + (max - mean) * 0.25).max(MIN_JUMP);

    let mut picked: Vec<(f32, f32)> = Vec::new();
    for i in 1..n {
        let c = change[i];
        if c < threshold || c < change[i - 1] || change.get(i + 1).is_some_and(|&next| c < next) {
            continue;
        }
        let t = samples[i].time;
        if t < min_spacing || duration - t < min_spacing {
            continue;
        }
        match picked.len() {
            len if len > 0 && t - picked[len - 1].0 < min_spacing => {
                let fits = len < 2 || t - picked[len - 2].0 >= min_spacing;
                if c > picked[len - 1].1 && fits {
                    picked[len - 1] = (t, c);
                }
            }
            _ => picked.push((t, c)),
        }
    }

    picked.into_iter().map(|(t, _)| t).collect()
}

fn average_energy(samples: &[EnergySample], start: f32, end: f32) -> f32 {
    let inside: Vec<f32> = samples
        .iter()
        .filter(|s| s.time >= start && s.time < end)
        .map(|s| s.energy)
        .collect();
    if inside.is_empty() {
        // Shorter than a segment: use the segment that covers `start`
        let idx = samples.partition_point(|s| s.time <= start).saturating_sub(1);
        return samples.get(idx).map_or(0.0, |s| s.energy);
    }
    inside.iter().sum::<f32>() / inside.len() as f32
}

fn classify(avg: f32, gates: &Gates) -> SectionType {
    if !gates.low_dynamic && avg >= gates.p88 && avg > gates.p50 + 0.15 {
        SectionType::Drop
    } else if avg >= gates.p75 && avg > gates.p50 + 0.08 {
        SectionType::Chorus
    } else if avg >= gates.p20 - 0.03 || avg >= gates.p50 - 0.1 {
        SectionType::Verse
    } else {
        SectionType::Bridge
    }
}

/// Quiet opening followed by a sharp rise; quiet tail after a louder section.
fn label_edges(sections: &mut [SectionInfo], gates: &Gates) {
    let n = sections.len();
    if n < 2 {
        return;
    }
    if sections[0].avg_energy < gates.p50
        && sections[1].avg_energy >= sections[0].avg_energy + 0.2
    {
        relabel(&mut sections[0], SectionType::Intro);
    }
    if sections[n - 1].avg_energy < gates.p50
        && sections[n - 1].avg_energy <= sections[n - 2].avg_energy - 0.1
    {
        relabel(&mut sections[n - 1], SectionType::Outro);
    }
}

fn mark_interludes(
    sections: &mut [SectionInfo],
    gates: &Gates,
    duration: f32,
    config: &StructureConfig,
) {
    let strictness = config.interlude_strictness.clamp(0.0, 1.0);
    let min_len = 2.8 + 1.4 * strictness;
    let rebound = 0.15 + 0.05 * strictness;
    let margin = (0.1 * duration).max(8.0);

    for i in 1..sections.len().saturating_sub(1) {
        let (prev, cur, next) = (sections[i - 1], sections[i], sections[i + 1]);
        if cur.start < margin || cur.end > duration - margin || cur.len() < min_len {
            continue;
        }
        let deep = cur.avg_energy <= 0.5 * prev.avg_energy || cur.avg_energy < INTERLUDE_FLOOR;
        let below_track = cur.avg_energy < 0.6 * gates.mean;
        let rebounds = prev.avg_energy >= cur.avg_energy + rebound
            && next.avg_energy >= cur.avg_energy + rebound;
        if deep && below_track && rebounds {
            relabel(&mut sections[i], SectionType::Interlude);
        }
    }
}

/// Relabel intro/outro/interlude sections that are too long or not quiet enough.
fn demote_implausible(sections: &mut [SectionInfo], gates: &Gates, duration: f32) {
    let max_edge = (0.2 * duration).max(12.0);
    let max_interlude = (0.15 * duration).max(10.0);

    for s in sections.iter_mut() {
        let keep = match s.kind {
            SectionType::Intro | SectionType::Outro => {
                s.len() <= max_edge && s.avg_energy < gates.p50
            }
            SectionType::Interlude => {
                s.len() <= max_interlude && s.avg_energy < 0.8 * gates.mean
            }
            _ => true,
        };
        if !keep {
            let kind = match classify(s.avg_energy, gates) {
                SectionType::Bridge => SectionType::Bridge,
                _ => SectionType::Verse,
            };
            relabel(s, kind);
        }
    }
}

/// Keep at least 45 % of the track playable.
fn protect_playable(sections: &mut [SectionInfo], duration: f32) {
    let playable: f32 = sections
        .iter()
        .filter(|s| s.kind.is_playable())
        .map(|s| s.len())
        .sum();
    if playable >= MIN_PLAYABLE_SHARE * duration {
        return;
    }

    let short_edge = (0.08 * duration).clamp(4.0, 12.0);
    let last = sections.len() - 1;
    for (i, s) in sections.iter_mut().enumerate() {
        if s.kind.is_playable() {
            continue;
        }
        let short_intro = i == 0 && s.kind == SectionType::Intro && s.len() <= short_edge;
        let short_outro = i == last && s.kind == SectionType::Outro && s.len() <= short_edge;
        if !(short_intro || short_outro) {
            relabel(s, SectionType::Verse);
        }
    }
    log::debug!(
        "Playable share {:.0}% below minimum, demoted quiet sections",
        100.0 * playable / duration
    );
}
