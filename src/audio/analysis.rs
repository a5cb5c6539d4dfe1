use serde::{Deserialize, Serialize};

use super::context::AnalysisContext;
use super::features::{BeatEstimate, OnsetEvent, SectionInfo, SpectralProfile, TempoHint, Waveform};
use super::onset::{compute_flux_profile, pick_sensitivity_for_rate, quantize_onsets};
use super::sections::{detect_structure, StructureConfig};
use super::spectral::profile_points;
use super::tempo::{estimate_beat, TempoConfig};
use crate::error::{AnalysisError, Result};

/// Sensitivities tried when no fixed sensitivity is configured.
const SENSITIVITY_SWEEP: [f32; 5] = [0.6, 0.85, 1.0, 1.2, 1.4];
const MIN_FRAME_SIZE: usize = 256;

#[derive(Clone, Debug, Deserialize)]
pub struct AnalysisSettings {
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_hop_size")]
    pub hop_size: usize,
    #[serde(default = "default_spectral_frame_size")]
    pub spectral_frame_size: usize,
    /// Fixed onset sensitivity; swept against `target_onset_rate` when unset
    #[serde(default)]
    pub sensitivity: Option<f32>,
    /// Onsets per second the sweep aims for
    #[serde(default = "default_target_onset_rate")]
    pub target_onset_rate: f32,
    #[serde(flatten)]
    pub tempo: TempoConfig,
    #[serde(flatten)]
    pub structure: StructureConfig,
}

fn default_frame_size() -> usize { 1024 }
fn default_hop_size() -> usize { 256 }
fn default_spectral_frame_size() -> usize { 2048 }
fn default_target_onset_rate() -> f32 { 2.5 }

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            hop_size: default_hop_size(),
            spectral_frame_size: default_spectral_frame_size(),
            sensitivity: None,
            target_onset_rate: default_target_onset_rate(),
            tempo: TempoConfig::default(),
            structure: StructureConfig::default(),
        }
    }
}

impl AnalysisSettings {
    /// Cheaper variant for constrained devices: half the flux frames and a
    /// smaller spectral window.
    pub fn lighter(&self) -> Self {
        Self {
            hop_size: (self.hop_size * 2).min(self.frame_size),
            spectral_frame_size: (self.spectral_frame_size / 2).max(256),
            ..self.clone()
        }
    }

    /// Rejects values the stages cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, size) in [
            ("frame_size", self.frame_size),
            ("spectral_frame_size", self.spectral_frame_size),
        ] {
            if size < MIN_FRAME_SIZE || !size.is_power_of_two() {
                return Err(AnalysisError::InvalidSettings(format!(
                    "{} must be a power of two >= {}, got {}",
                    name, MIN_FRAME_SIZE, size
                )));
            }
        }
        if self.hop_size == 0 || self.hop_size > self.frame_size {
            return Err(AnalysisError::InvalidSettings(format!(
                "hop_size must be in 1..={}, got {}",
                self.frame_size, self.hop_size
            )));
        }
        if let Some(s) = self.sensitivity {
            if !(s.is_finite() && s > 0.0) {
                return Err(AnalysisError::InvalidSettings(format!(
                    "sensitivity must be positive, got {}",
                    s
                )));
            }
        }
        if !(self.target_onset_rate.is_finite() && self.target_onset_rate > 0.0) {
            return Err(AnalysisError::InvalidSettings(format!(
                "target_onset_rate must be positive, got {}",
                self.target_onset_rate
            )));
        }
        self.tempo.validate()
    }
}

/// Everything the chart builder needs about one track.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackAnalysis {
    pub duration: f32,
    pub sample_rate: u32,
    pub beat: BeatEstimate,
    /// Sensitivity the onsets were picked at
    pub sensitivity: f32,
    pub onsets: Vec<OnsetEvent>,
    pub sections: Vec<SectionInfo>,
    /// One profile per beat
    pub spectral: Vec<SpectralProfile>,
}

/// Beat grid times inside `[0, duration)`.
pub fn beat_times(beat: &BeatEstimate, duration: f32) -> Vec<f32> {
    if !(beat.beat_interval.is_finite() && beat.beat_interval > 0.0) {
        return Vec::new();
    }
    let offset = beat.first_beat_offset.max(0.0);
    (0..)
        .map(|k| offset + k as f32 * beat.beat_interval)
        .take_while(|&t| t < duration)
        .collect()
}

/// Run tempo, onset, structure and spectral analysis over one waveform.
///
/// `progress` receives a stage name and a 0.0-1.0 fraction within that stage.
pub fn analyze_track(
    ctx: &mut AnalysisContext,
    waveform: &Waveform,
    settings: &AnalysisSettings,
    hint: Option<TempoHint>,
    progress: &mut dyn FnMut(&str, f32),
) -> Result<TrackAnalysis> {
    settings.validate()?;
    let sr = waveform.sample_rate;
    let duration = waveform.duration;
    let mono = ctx.mono_of(waveform);

    log::info!("Stage 1: Tempo...");
    progress("tempo", 0.0);
    let beat = estimate_beat(ctx, waveform, &settings.tempo, hint);
    progress("tempo", 1.0);
    log::debug!(
        "Beat: {:.2} BPM (confidence {:.2}, offset {:.3}s, {:?})",
        beat.bpm,
        beat.confidence,
        beat.first_beat_offset,
        beat.source
    );

    log::info!(
        "Stage 2: Onsets (frame={}, hop={})...",
        settings.frame_size,
        settings.hop_size
    );
    let profile = compute_flux_profile(
        ctx,
        &mono,
        sr,
        None,
        settings.frame_size,
        settings.hop_size,
        &mut |f| progress("onsets", f),
    )?;
    let (sensitivity, raw) = match settings.sensitivity {
        Some(s) => (s, profile.detect(s)),
        None => pick_sensitivity_for_rate(&profile, &SENSITIVITY_SWEEP, settings.target_onset_rate),
    };
    let onsets = quantize_onsets(&raw, &beat, duration);
    progress("onsets", 1.0);
    log::info!(
        "Onsets: {} at sensitivity {:.2} ({} after quantizing)",
        raw.len(),
        sensitivity,
        onsets.len()
    );

    log::info!("Stage 3: Sections...");
    progress("sections", 0.0);
    let sections = detect_structure(ctx, waveform, &settings.structure);
    progress("sections", 1.0);
    log::info!("Sections: {}", sections.len());

    log::info!("Stage 4: Spectral profile...");
    progress("spectral", 0.0);
    let times = beat_times(&beat, duration);
    let spectral = profile_points(ctx, &mono, sr, &times, settings.spectral_frame_size)?;
    progress("spectral", 1.0);

    Ok(TrackAnalysis {
        duration,
        sample_rate: sr,
        beat,
        sensitivity,
        onsets,
        sections,
        spectral,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::{BeatSource, SectionType};
    use std::f32::consts::PI;

    /// Decaying 60 Hz body with a short 2 kHz click on every beat.
    fn kick_track(bpm: f32, offset: f32, seconds: f32, sr: u32) -> Vec<f32> {
        let len = (seconds * sr as f32) as usize;
        let mut out = vec![0.0f32; len];
        let period = 60.0 / bpm;
        let kick_len = (0.15 * sr as f32) as usize;
        let mut t0 = offset;
        while t0 < seconds {
            let start = (t0 * sr as f32) as usize;
            for i in 0..kick_len.min(len.saturating_sub(start)) {
                let t = i as f32 / sr as f32;
                out[start + i] += 0.8 * (2.0 * PI * 60.0 * t).sin() * (-t / 0.04).exp()
                    + 0.3 * (2.0 * PI * 2000.0 * t).sin() * (-t / 0.005).exp();
            }
            t0 += period;
        }
        out
    }

    #[test]
    fn kick_track_end_to_end() {
        let sr = 22050;
        let wf = Waveform::new(sr, vec![kick_track(130.0, 0.1, 120.0, sr)]).unwrap();
        let mut ctx = AnalysisContext::new();
        let mut stages: Vec<String> = Vec::new();
        let analysis = analyze_track(&mut ctx, &wf, &AnalysisSettings::default(), None, &mut |stage, _| {
            if stages.last().map(String::as_str) != Some(stage) {
                stages.push(stage.to_string());
            }
        })
        .unwrap();

        assert_eq!(stages, vec!["tempo", "onsets", "sections", "spectral"]);
        assert_eq!(analysis.beat.source, BeatSource::Autocorrelation);
        assert!((analysis.beat.bpm - 130.0).abs() < 2.0, "bpm {}", analysis.beat.bpm);
        assert!(analysis.beat.confidence >= 0.5, "confidence {}", analysis.beat.confidence);

        assert!(analysis.onsets.len() > 150 && analysis.onsets.len() < 600);
        assert!(analysis.onsets.windows(2).all(|w| w[0].time <= w[1].time));

        let sections = &analysis.sections;
        assert!(sections.iter().all(|s| !s.interlude));
        assert_eq!(sections[0].start, 0.0);
        assert_eq!(sections.last().unwrap().end, wf.duration);
        let steady: f32 = sections
            .iter()
            .filter(|s| matches!(s.kind, SectionType::Verse | SectionType::Drop | SectionType::Chorus))
            .map(|s| s.len())
            .sum();
        assert!(steady >= 0.7 * wf.duration);

        assert_eq!(
            analysis.spectral.len(),
            beat_times(&analysis.beat, wf.duration).len()
        );
    }

    #[test]
    fn hint_and_fixed_sensitivity_are_honoured() {
        let sr = 22050;
        let wf = Waveform::new(sr, vec![kick_track(100.0, 0.0, 10.0, sr)]).unwrap();
        let settings = AnalysisSettings {
            sensitivity: Some(1.1),
            ..AnalysisSettings::default()
        };
        let hint = TempoHint {
            bpm: 100.0,
            confidence: 0.9,
            first_beat_offset: 0.0,
        };
        let analysis =
            analyze_track(&mut AnalysisContext::new(), &wf, &settings, Some(hint), &mut |_, _| {})
                .unwrap();
        assert_eq!(analysis.beat.source, BeatSource::Hint);
        assert_eq!(analysis.sensitivity, 1.1);
        // Beats at 0.0, 0.6, ..., 9.6
        assert_eq!(analysis.spectral.len(), 17);
    }

    #[test]
    fn lighter_settings_halve_the_work() {
        let base = AnalysisSettings::default();
        let light = base.lighter();
        assert_eq!(light.hop_size, 512);
        assert_eq!(light.spectral_frame_size, 1024);
        assert_eq!(light.frame_size, base.frame_size);
    }

    #[test]
    fn unusable_settings_are_rejected() {
        assert!(AnalysisSettings::default().validate().is_ok());
        assert!(AnalysisSettings::default().lighter().validate().is_ok());

        let reject = |settings: AnalysisSettings| {
            assert!(
                matches!(settings.validate(), Err(AnalysisError::InvalidSettings(_))),
                "{:?}",
                settings
            );
        };
        let base = AnalysisSettings::default;
        reject(AnalysisSettings { spectral_frame_size: 0, ..base() });
        reject(AnalysisSettings { spectral_frame_size: 1, ..base() });
        reject(AnalysisSettings { spectral_frame_size: 128, ..base() });
        reject(AnalysisSettings { frame_size: 1000, ..base() });
        reject(AnalysisSettings { hop_size: 0, ..base() });
        reject(AnalysisSettings { hop_size: 4096, ..base() });
        reject(AnalysisSettings { sensitivity: Some(0.0), ..base() });
        reject(AnalysisSettings { target_onset_rate: f32::NAN, ..base() });
        reject(AnalysisSettings {
            tempo: TempoConfig { bpm_min: 190.0, bpm_max: 80.0 },
            ..base()
        });
        reject(AnalysisSettings {
            tempo: TempoConfig { bpm_min: 0.0, bpm_max: 180.0 },
            ..base()
        });
    }

    #[test]
    fn analysis_refuses_invalid_settings() {
        let sr = 22050;
        let wf = Waveform::new(sr, vec![kick_track(120.0, 0.0, 4.0, sr)]).unwrap();
        let settings = AnalysisSettings {
            tempo: TempoConfig { bpm_min: 190.0, bpm_max: 80.0 },
            ..AnalysisSettings::default()
        };
        let result = analyze_track(&mut AnalysisContext::new(), &wf, &settings, None, &mut |_, _| {});
        assert!(matches!(result, Err(AnalysisError::InvalidSettings(_))));
    }

    #[test]
    fn beat_grid_stays_inside_the_track() {
        let beat = BeatEstimate::new(120.0, 0.8, 0.25, BeatSource::Autocorrelation);
        let times = beat_times(&beat, 2.0);
        assert_eq!(times, vec![0.25, 0.75, 1.25, 1.75]);
        assert!(beat_times(&beat, 0.0).is_empty());
    }
}
