//! Global tempo and first-beat estimation from an energy envelope.

use serde::Deserialize;

use super::context::AnalysisContext;
use super::features::{BeatEstimate, BeatSource, TempoHint, Waveform};
use crate::error::{AnalysisError, Result};

const ENVELOPE_WINDOW: usize = 512;
const ENVELOPE_HOP: usize = 256;
const MIN_DURATION: f32 = 2.0;
/// Lag spans wider than this are scanned every other lag first.
const COARSE_SPAN: usize = 40;
const OFFSET_SEARCH_SECS: f32 = 5.0;
const MAX_OFFSET_CANDIDATES: usize = 10;
/// Weaker/stronger half-cycle mass above which the half lag is the beat.
const HALF_CYCLE_BALANCE: f32 = 0.85;

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct TempoConfig {
    #[serde(default = "default_bpm_min")]
    pub bpm_min: f32,
    #[serde(default = "default_bpm_max")]
    pub bpm_max: f32,
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            bpm_min: default_bpm_min(),
            bpm_max: default_bpm_max(),
        }
    }
}

fn default_bpm_min() -> f32 { 75.0 }
fn default_bpm_max() -> f32 { 185.0 }

impl TempoConfig {
    pub fn contains(&self, bpm: f32) -> bool {
        bpm.is_finite() && bpm >= self.bpm_min && bpm <= self.bpm_max
    }

    /// The range must be positive and at least an octave wide so octave
    /// correction always lands inside it.
    pub fn validate(&self) -> Result<()> {
        let (min, max) = (self.bpm_min, self.bpm_max);
        if !(min.is_finite() && max.is_finite() && min > 0.0 && min < max) {
            return Err(AnalysisError::InvalidSettings(format!(
                "bpm range {}-{} must satisfy 0 < bpm_min < bpm_max",
                min, max
            )));
        }
        if max < 2.0 * min {
            return Err(AnalysisError::InvalidSettings(format!(
                "bpm range {}-{} is narrower than an octave",
                min, max
            )));
        }
        Ok(())
    }
}

/// Energy envelope sampled at a fixed frame rate.
pub struct Envelope {
    pub values: Vec<f32>,
    /// Frames per second
    pub rate: f32,
    /// Time of frame `i` is `i / rate + lead`
    pub lead: f32,
}

/// RMS envelope of `mono` over fixed windows.
pub fn energy_envelope(mono: &[f32], sample_rate: u32) -> Envelope {
    let sr = sample_rate as f32;
    let values = if mono.len() < ENVELOPE_WINDOW {
        Vec::new()
    } else {
        (0..=(mono.len() - ENVELOPE_WINDOW) / ENVELOPE_HOP)
            .map(|i| {
                let frame = &mono[i * ENVELOPE_HOP..i * ENVELOPE_HOP + ENVELOPE_WINDOW];
                (frame.iter().map(|s| s * s).sum::<f32>() / ENVELOPE_WINDOW as f32).sqrt()
            })
            .collect()
    };

    Envelope {
        values,
        rate: sr / ENVELOPE_HOP as f32,
        // A rise in frame i comes from audio entering at the window's leading edge
        lead: (ENVELOPE_WINDOW as f32 - 0.5 * ENVELOPE_HOP as f32) / sr,
    }
}

/// Tempo for a whole track. A valid `hint` short-circuits the estimator.
pub fn estimate_beat(
    ctx: &mut AnalysisContext,
    waveform: &Waveform,
    config: &TempoConfig,
    hint: Option<TempoHint>,
) -> BeatEstimate {
    if let Some(hint) = hint {
        if config.contains(hint.bpm) {
            let confidence = if hint.confidence.is_finite() {
                hint.confidence.clamp(0.35, 0.99)
            } else {
                0.35
            };
            let offset = if hint.first_beat_offset.is_finite() {
                hint.first_beat_offset.max(0.0)
            } else {
                0.0
            };
            log::info!("Using tempo hint: {:.2} BPM", hint.bpm);
            return BeatEstimate::new(hint.bpm, confidence, offset, BeatSource::Hint);
        }
        log::warn!(
            "Ignoring tempo hint {:.2} BPM outside {:.0}-{:.0}",
            hint.bpm,
            config.bpm_min,
            config.bpm_max
        );
    }

    if waveform.duration < MIN_DURATION {
        log::debug!("Audio shorter than {}s, using fallback tempo", MIN_DURATION);
        return BeatEstimate::fallback();
    }

    let mono = ctx.mono_of(waveform);
    let envelope = energy_envelope(&mono, waveform.sample_rate);
    estimate_from_envelope(&envelope, config)
}

/// Autocorrelation tempo estimate over an energy envelope.
pub fn estimate_from_envelope(envelope: &Envelope, config: &TempoConfig) -> BeatEstimate {
    let onset = onset_envelope(&envelope.values);
    let rate = envelope.rate;
    if rate <= 0.0 || onset.is_empty() || config.validate().is_err() {
        return BeatEstimate::fallback();
    }

    let min_lag = ((60.0 / config.bpm_max * rate).floor() as usize).max(1);
    let max_lag = (60.0 / config.bpm_min * rate).ceil() as usize;

    // Middle 80 % only, skipping intro and outro
    let lo = onset.len() / 10;
    let hi = onset.len() - onset.len() / 10;
    let body = &onset[lo..hi];
    if body.len() <= max_lag + 2 || body.iter().all(|&v| v <= 0.0) {
        log::debug!("Envelope too short or flat for autocorrelation");
        return BeatEstimate::fallback();
    }

    let step = if max_lag - min_lag > COARSE_SPAN { 2 } else { 1 };
    let mut best = (min_lag, f32::MIN);
    for lag in (min_lag..=max_lag).step_by(step) {
        let r = autocorrelation(body, lag);
        if r > best.1 {
            best = (lag, r);
        }
    }
    if step > 1 {
        let from = best.0.saturating_sub(2).max(min_lag);
        let to = (best.0 + 2).min(max_lag);
        for lag in from..=to {
            let r = autocorrelation(body, lag);
            if r > best.1 {
                best = (lag, r);
            }
        }
    }

    // Clicks with a fractional period can correlate better at twice the
    // period. Take the half lag only when it is nearly as strong and the
    // pulses half a cycle apart carry the same weight; a kick with quieter
    // off-beat hats stays at the kick tempo.
    let half = best.0 / 2;
    if half > min_lag && half_cycle_balance(body, best.0) >= HALF_CYCLE_BALANCE {
        let sub = (half - 1..=half + 1)
            .map(|lag| (lag, autocorrelation(body, lag)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some(sub) = sub.filter(|s| s.1 >= 0.8 * best.1) {
            best = sub;
        }
    }

    let (lag, peak) = best;
    let period = if lag > 1 {
        let left = autocorrelation(body, lag - 1);
        let right = autocorrelation(body, lag + 1);
        let denom = left - 2.0 * peak + right;
        let delta = if denom.abs() > 1e-9 {
            (0.5 * (left - right) / denom).clamp(-0.5, 0.5)
        } else {
            0.0
        };
        lag as f32 + delta
    } else {
        lag as f32
    };

    let bpm = octave_correct(60.0 * rate / period, config);
    let confidence = peak.clamp(0.0, 1.0);
    let interval = 60.0 / bpm;
    let offset = first_beat_offset(&onset, rate, envelope.lead, interval);

    log::info!(
        "Tempo: {:.2} BPM (lag {:.2}, confidence {:.2}, first beat {:.3}s)",
        bpm,
        period,
        confidence,
        offset
    );
    BeatEstimate::new(bpm, confidence, offset, BeatSource::Autocorrelation)
}

/// Half-wave rectified first difference. Index `i` is the rise into frame `i + 1`.
fn onset_envelope(values: &[f32]) -> Vec<f32> {
    values.windows(2).map(|w| (w[1] - w[0]).max(0.0)).collect()
}

/// Normalized autocorrelation of `x` at `lag`.
fn autocorrelation(x: &[f32], lag: usize) -> f32 {
    if lag >= x.len() {
        return 0.0;
    }
    let (mut cross, mut a2, mut b2) = (0.0f64, 0.0f64, 0.0f64);
    for (a, b) in x.iter().zip(&x[lag..]) {
        let (a, b) = (*a as f64, *b as f64);
        cross += a * b;
        a2 += a * a;
        b2 += b * b;
    }
    let denom = (a2 * b2).sqrt();
    if denom <= 1e-12 {
        0.0
    } else {
        (cross / denom) as f32
    }
}

/// Folds `x` at `lag` and compares the onset mass around the strongest
/// phase with the mass half a cycle later. 1.0 means equal pulses.
fn half_cycle_balance(x: &[f32], lag: usize) -> f32 {
    if lag < 4 {
        return 0.0;
    }
    let mut folded = vec![0.0f64; lag];
    for (i, &v) in x.iter().enumerate() {
        folded[i % lag] += v as f64;
    }
    let around = |center: usize, radius: usize| -> f64 {
        (0..=2 * radius)
            .map(|d| folded[(center + lag - radius + d) % lag])
            .sum()
    };

    let peak = (0..lag)
        .max_by(|&a, &b| around(a, 3).total_cmp(&around(b, 3)))
        .unwrap_or(0);
    let quarter = lag / 4;
    let main = around(peak, quarter);
    let other = around((peak + lag / 2) % lag, quarter);
    let stronger = main.max(other);
    if stronger <= 1e-12 {
        0.0
    } else {
        (main.min(other) / stronger) as f32
    }
}

fn octave_correct(mut bpm: f32, config: &TempoConfig) -> f32 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return 120.0;
    }
    for _ in 0..8 {
        if bpm < config.bpm_min {
            bpm *= 2.0;
        } else if bpm > config.bpm_max {
            bpm /= 2.0;
        } else {
            break;
        }
    }
    bpm
}

/// Offset of the first beat: the early peak whose beat grid explains most peaks.
fn first_beat_offset(onset: &[f32], rate: f32, lead: f32, interval: f32) -> f32 {
    let time_of = |i: usize| (i + 1) as f32 / rate + lead;
    let span = ((OFFSET_SEARCH_SECS * rate) as usize).min(onset.len());
    let window = &onset[..span];
    let max = window.iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 || window.len() < 3 {
        return 0.0;
    }

    let peaks: Vec<f32> = (1..window.len() - 1)
        .filter(|&i| {
            window[i] >= 0.3 * max && window[i] > window[i - 1] && window[i] >= window[i + 1]
        })
        .map(time_of)
        .collect();
    if peaks.is_empty() {
        return 0.0;
    }

    let tolerance = 0.15 * interval;
    let mut best = (peaks[0], 0usize);
    for &candidate in peaks.iter().take(MAX_OFFSET_CANDIDATES) {
        let hits = peaks
            .iter()
            .filter(|&&p| {
                let beats = (p - candidate) / interval;
                (beats - beats.round()).abs() * interval <= tolerance
            })
            .count();
        if hits > best.1 {
            best = (candidate, hits);
        }
    }
    best.0
}
