//! Multi-band spectral-flux onset detection.
//!
//! A [`FluxProfile`] is computed once per pass and can be re-thresholded at
//! several sensitivities without repeating the transforms.

use super::context::AnalysisContext;
use super::features::{Band, BeatEstimate, OnsetEvent};
use crate::error::Result;

const LOW_MAX_HZ: f32 = 240.0;
const MID_MAX_HZ: f32 = 4200.0;
const HIGH_MAX_HZ: f32 = 18000.0;
const PRESENCE_HZ: (f32, f32) = (900.0, 3800.0);
const PRESENCE_BOOST: f32 = 1.35;

const CLUSTER_WINDOW: f32 = 0.038;
const REFRACTORY: f32 = 0.052;

/// Sub-range of a signal, in seconds.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(not(test), allow(dead_code))]
pub struct TimeRange {
    pub start: f32,
    pub duration: f32,
}

/// Per-frame band flux and band RMS energy.
#[derive(Clone, Debug, Default)]
pub struct FluxProfile {
    pub low: Vec<f32>,
    pub mid: Vec<f32>,
    pub high: Vec<f32>,
    pub low_energy: Vec<f32>,
    pub mid_energy: Vec<f32>,
    pub high_energy: Vec<f32>,
    /// Frames per second
    pub frame_rate: f32,
    /// Time of frame 0 (window centre), seconds
    pub start_time: f32,
}

impl FluxProfile {
    pub fn len(&self) -> usize {
        self.low.len()
    }

    pub fn band(&self, band: Band) -> &[f32] {
        match band {
            Band::Low => &self.low,
            Band::Mid => &self.mid,
            Band::High => &self.high,
        }
    }

    pub fn find_peaks(&self, band: Band, sensitivity: f32) -> Vec<OnsetEvent> {
        pick_peaks(
            self.band(band),
            self.frame_rate,
            self.start_time,
            sensitivity,
            Some(band),
        )
    }

    /// Per-band peaks fused into one consensus stream.
    pub fn detect(&self, sensitivity: f32) -> Vec<OnsetEvent> {
        fuse_onsets_by_band_consensus(
            &self.find_peaks(Band::Low, sensitivity),
            &self.find_peaks(Band::Mid, sensitivity),
            &self.find_peaks(Band::High, sensitivity),
        )
    }
}

/// Windowed transforms over `mono` (or a sub-range of it) producing
/// SuperFlux-style rectified flux for the low, mid and high bands.
pub fn compute_flux_profile(
    ctx: &mut AnalysisContext,
    mono: &[f32],
    sample_rate: u32,
    range: Option<TimeRange>,
    frame_size: usize,
    hop_size: usize,
    progress: &mut dyn FnMut(f32),
) -> Result<FluxProfile> {
    let plan = ctx.plan_of(frame_size)?;
    let window = ctx.window_of(frame_size);
    let sr = sample_rate as f32;
    let hop_size = hop_size.max(1);

    let (start_sample, end_sample) = match range {
        Some(r) => {
            let start = ((r.start.max(0.0) * sr) as usize).min(mono.len());
            let end = (((r.start + r.duration).max(0.0) * sr) as usize).min(mono.len());
            (start, end.max(start))
        }
        None => (0, mono.len()),
    };

    let mut profile = FluxProfile {
        frame_rate: sr / hop_size as f32,
        start_time: (start_sample + frame_size / 2) as f32 / sr,
        ..Default::default()
    };

    if end_sample - start_sample < frame_size {
        return Ok(profile);
    }
    let total_frames = (end_sample - start_sample - frame_size) / hop_size + 1;

    let half = frame_size / 2;
    let bin_hz = sr / frame_size as f32;
    let bin_of = |hz: f32| ((hz / bin_hz).ceil() as usize).min(half);
    let low_end = bin_of(LOW_MAX_HZ);
    let mid_end = bin_of(MID_MAX_HZ).max(low_end);
    let high_end = bin_of(HIGH_MAX_HZ.min(sr / 2.0)).max(mid_end);
    let presence = (bin_of(PRESENCE_HZ.0), bin_of(PRESENCE_HZ.1));

    let mut re = vec![0.0f32; frame_size];
    let mut im = vec![0.0f32; frame_size];
    let mut prev = vec![0.0f32; half];
    let mut cur = vec![0.0f32; half];

    for frame in 0..total_frames {
        let pos = start_sample + frame * hop_size;
        for (i, (r, w)) in re.iter_mut().zip(window.iter()).enumerate() {
            *r = mono[pos + i] * w;
        }
        im.fill(0.0);
        plan.forward(&mut re, &mut im)?;

        for k in 0..half {
            cur[k] = re[k] * re[k] + im[k] * im[k];
        }

        let mut flux = [0.0f32; 3];
        let mut energy = [0.0f32; 3];
        for k in 1..high_end {
            let band = if k < low_end {
                0
            } else if k < mid_end {
                1
            } else {
                2
            };
            energy[band] += cur[k];

            if frame == 0 {
                continue;
            }
            let reference = prev[k]
                .max(prev[k - 1])
                .max(prev.get(k + 1).copied().unwrap_or(0.0));
            let diff = cur[k] - reference;
            if diff > 0.0 {
                let weight = if band == 1 && k >= presence.0 && k < presence.1 {
                    PRESENCE_BOOST
                } else {
                    1.0
                };
                flux[band] += diff * weight;
            }
        }

        let counts = [
            low_end.saturating_sub(1),
            mid_end - low_end,
            high_end - mid_end,
        ];
        profile.low.push(flux[0]);
        profile.mid.push(flux[1]);
        profile.high.push(flux[2]);
        profile.low_energy.push(band_rms(energy[0], counts[0]));
        profile.mid_energy.push(band_rms(energy[1], counts[1]));
        profile.high_energy.push(band_rms(energy[2], counts[2]));

        std::mem::swap(&mut prev, &mut cur);
        if frame % 256 == 0 {
            progress(frame as f32 / total_frames as f32);
        }
    }
    progress(1.0);

    log::debug!(
        "Flux profile: {} frames at {:.1} fps from {:.2}s",
        profile.len(),
        profile.frame_rate,
        profile.start_time
    );
    Ok(profile)
}

fn band_rms(energy: f32, bins: usize) -> f32 {
    if bins == 0 {
        0.0
    } else {
        (energy / bins as f32).sqrt()
    }
}

/// Adaptive peak picking over one flux sequence.
///
/// Thresholds tighten as `sensitivity` drops and as the material gets
/// noisier (mean and deviation close to the peak).
pub fn pick_peaks(
    values: &[f32],
    frame_rate: f32,
    start_time: f32,
    sensitivity: f32,
    band: Option<Band>,
) -> Vec<OnsetEvent> {
    let n = values.len();
    if n < 3 || frame_rate <= 0.0 || !frame_rate.is_finite() {
        return Vec::new();
    }

    let global_max = values.iter().copied().fold(0.0f32, f32::max);
    if global_max < 1e-9 {
        return Vec::new();
    }
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n as f64;
    let std = var.sqrt() as f32;
    let mean = mean as f32;

    let noisiness = (2.2 * mean / global_max + 0.8 * std / global_max).clamp(0.0, 1.0);
    let caution = ((1.5 - sensitivity) / 1.25).clamp(0.0, 1.0);

    let min_interval = 0.030 + 0.007 * caution + 0.004 * noisiness;
    let min_gap = ((min_interval * frame_rate).round() as usize).max(1);
    let std_weight = 0.5 + caution + 0.5 * noisiness;
    let floor = (0.04 + 0.06 * caution + 0.06 * noisiness) * global_max;
    let prominence_frac = 0.06 + 0.06 * caution;
    let ratio_gate = 1.4 + 0.6 * caution;

    let radius = ((0.1 * frame_rate).round() as usize).max(2);
    let mut sum = vec![0.0f64; n + 1];
    let mut sum_sq = vec![0.0f64; n + 1];
    for (i, &v) in values.iter().enumerate() {
        sum[i + 1] = sum[i] + v as f64;
        sum_sq[i + 1] = sum_sq[i] + (v as f64) * (v as f64);
    }

    let mut picked: Vec<(usize, f32)> = Vec::new();
    for i in 1..n - 1 {
        let v = values[i];
        if v <= values[i - 1] || v <= values[i + 1] || v < floor {
            continue;
        }

        let lo = i.saturating_sub(radius);
        let hi = (i + radius + 1).min(n);
        let count = (hi - lo) as f64;
        let local_mean = (sum[hi] - sum[lo]) / count;
        let local_var = ((sum_sq[hi] - sum_sq[lo]) / count - local_mean * local_mean).max(0.0);
        let local_mean = local_mean as f32;
        let threshold = local_mean + std_weight * local_var.sqrt() as f32 + floor;
        if v < threshold {
            continue;
        }

        let prominence = v - 0.5 * (values[i - 1] + values[i + 1]);
        if prominence < prominence_frac * v || prominence < 0.02 * global_max {
            continue;
        }
        if noisiness > 0.5 && v < ratio_gate * local_mean {
            continue;
        }

        match picked.last_mut() {
            Some(last) if i - last.0 < min_gap => {
                if v > last.1 {
                    *last = (i, v);
                }
            }
            _ => picked.push((i, v)),
        }
    }

    picked
        .into_iter()
        .map(|(i, v)| OnsetEvent {
            time: start_time + i as f32 / frame_rate,
            strength: (v / global_max).powf(0.72).min(1.0),
            band,
        })
        .collect()
}

/// Merge per-band peaks into one stream, keeping clusters the bands agree on.
pub fn fuse_onsets_by_band_consensus(
    low: &[OnsetEvent],
    mid: &[OnsetEvent],
    high: &[OnsetEvent],
) -> Vec<OnsetEvent> {
    let mut all: Vec<(Band, OnsetEvent)> = low
        .iter()
        .map(|e| (Band::Low, *e))
        .chain(mid.iter().map(|e| (Band::Mid, *e)))
        .chain(high.iter().map(|e| (Band::High, *e)))
        .collect();
    if all.is_empty() {
        return Vec::new();
    }
    all.sort_by(|a, b| a.1.time.total_cmp(&b.1.time));

    let mut accepted = Vec::new();
    let mut cluster: Vec<(Band, OnsetEvent)> = Vec::new();
    for item in all {
        if let Some(first) = cluster.first() {
            if item.1.time - first.1.time > CLUSTER_WINDOW {
                accepted.extend(resolve_cluster(&cluster));
                cluster.clear();
            }
        }
        cluster.push(item);
    }
    accepted.extend(resolve_cluster(&cluster));

    let mut fused: Vec<OnsetEvent> = Vec::with_capacity(accepted.len());
    for event in accepted {
        match fused.last_mut() {
            Some(last) if event.time - last.time < REFRACTORY => {
                if event.strength > last.strength {
                    *last = event;
                }
            }
            _ => fused.push(event),
        }
    }
    fused
}

fn resolve_cluster(cluster: &[(Band, OnsetEvent)]) -> Option<OnsetEvent> {
    if cluster.is_empty() {
        return None;
    }

    let mut best = [0.0f32; 3];
    let mut strongest = (Band::Mid, 0.0f32);
    let mut weighted_time = 0.0f32;
    let mut weight = 0.0f32;
    for (band, event) in cluster {
        let slot = &mut best[*band as usize];
        *slot = slot.max(event.strength);
        if event.strength > strongest.1 {
            strongest = (*band, event.strength);
        }
        weighted_time += event.time * event.strength;
        weight += event.strength;
    }

    let present: Vec<f32> = best.iter().copied().filter(|&s| s > 0.0).collect();
    let bands = present.len();
    let mean = present.iter().sum::<f32>() / bands.max(1) as f32;
    let max = strongest.1;
    let mid = best[Band::Mid as usize];

    if !(max >= 0.66 || (bands >= 2 && mean >= 0.3) || mid >= 0.4) {
        return None;
    }

    let time = if weight > 0.0 {
        weighted_time / weight
    } else {
        cluster[0].1.time
    };
    Some(OnsetEvent {
        time,
        strength: (0.7 * max + 0.3 * mean + 0.08 * (bands as f32 - 1.0)).min(1.0),
        band: if bands == 1 { Some(strongest.0) } else { None },
    })
}

/// Snap onsets onto the beat / half-beat grid when they are close enough.
///
/// Onsets that collapse onto the same grid point are merged, keeping the
/// stronger one. Onsets too far from any grid point keep their time.
pub fn quantize_onsets(onsets: &[OnsetEvent], beat: &BeatEstimate, duration: f32) -> Vec<OnsetEvent> {
    let half = beat.beat_interval * 0.5;
    if !(half.is_finite() && half > 0.0) || onsets.is_empty() {
        return onsets.to_vec();
    }

    let offset = if beat.first_beat_offset.is_finite() {
        beat.first_beat_offset
    } else {
        0.0
    };
    let first_k = (-offset / half).ceil() as i64;
    let end = duration.max(onsets.last().map_or(0.0, |o| o.time)) + half;
    let grid: Vec<f32> = (first_k..)
        .map(|k| offset + k as f32 * half)
        .take_while(|&t| t <= end)
        .collect();
    if grid.is_empty() {
        return onsets.to_vec();
    }

    let tolerance = 0.6 * half;
    let mut out: Vec<(Option<usize>, OnsetEvent)> = Vec::with_capacity(onsets.len());
    for onset in onsets {
        let idx = grid.partition_point(|&g| g < onset.time);
        let nearest = [idx.checked_sub(1), Some(idx).filter(|&i| i < grid.len())]
            .into_iter()
            .flatten()
            .min_by(|&a, &b| (grid[a] - onset.time).abs().total_cmp(&(grid[b] - onset.time).abs()));

        let snapped = nearest.filter(|&g| (grid[g] - onset.time).abs() <= tolerance);
        let event = match snapped {
            Some(g) => OnsetEvent {
                time: grid[g],
                ..*onset
            },
            None => *onset,
        };

        if let Some(g) = snapped {
            if let Some(existing) = out.iter_mut().rev().find(|(slot, _)| *slot == Some(g)) {
                if event.strength > existing.1.strength {
                    existing.1 = event;
                }
                continue;
            }
        }
        out.push((snapped, event));
    }

    let mut result: Vec<OnsetEvent> = out.into_iter().map(|(_, e)| e).collect();
    result.sort_by(|a, b| a.time.total_cmp(&b.time));
    result
}

/// Fused detection at several sensitivities over one profile.
pub fn sweep_sensitivity(profile: &FluxProfile, sensitivities: &[f32]) -> Vec<(f32, Vec<OnsetEvent>)> {
    sensitivities
        .iter()
        .map(|&s| (s, profile.detect(s)))
        .collect()
}

/// Sweep entry whose onset rate (per second) is closest to `target_rate`.
pub fn pick_sensitivity_for_rate(
    profile: &FluxProfile,
    sensitivities: &[f32],
    target_rate: f32,
) -> (f32, Vec<OnsetEvent>) {
    let seconds = (profile.len() as f32 / profile.frame_rate.max(1e-6)).max(1e-3);
    sweep_sensitivity(profile, sensitivities)
        .into_iter()
        .min_by(|a, b| {
            let da = (a.1.len() as f32 / seconds - target_rate).abs();
            let db = (b.1.len() as f32 / seconds - target_rate).abs();
            da.total_cmp(&db)
        })
        .unwrap_or((1.0, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::BeatSource;

    const FPS: f32 = 44100.0 / 512.0;

    fn event(time: f32, strength: f32) -> OnsetEvent {
        OnsetEvent {
            time,
            strength,
            band: None,
        }
    }

    #[test]
    fn zero_profile_has_no_onsets() {
        assert!(pick_peaks(&vec![0.0; 500], FPS, 0.0, 1.0, None).is_empty());
        assert!(pick_peaks(&[1.0, 2.0], FPS, 0.0, 1.0, None).is_empty());
        assert!(pick_peaks(&vec![1.0; 50], 0.0, 0.0, 1.0, None).is_empty());
    }

    #[test]
    fn isolated_spike_is_one_onset() {
        let mut values = vec![0.05; 400];
        values[200] = 1.0;
        let onsets = pick_peaks(&values, FPS, 0.0, 1.0, Some(Band::Low));
        assert_eq!(onsets.len(), 1);
        assert!((onsets[0].time - 200.0 / FPS).abs() < 1e-4);
        assert!((onsets[0].strength - 1.0).abs() < 1e-6);
        assert_eq!(onsets[0].band, Some(Band::Low));
    }

    #[test]
    fn close_spikes_collapse() {
        let mut values = vec![0.0; 400];
        values[200] = 1.0;
        values[202] = 0.8; // ~23 ms later
        let onsets = pick_peaks(&values, FPS, 0.0, 1.0, None);
        assert_eq!(onsets.len(), 1);
        assert!((onsets[0].time - 200.0 / FPS).abs() < 1e-4);
    }

    #[test]
    fn spaced_spikes_survive() {
        let mut values = vec![0.0; 600];
        for i in (50..550).step_by(43) {
            values[i] = 1.0;
        }
        let onsets = pick_peaks(&values, FPS, 1.5, 1.0, None);
        assert_eq!(onsets.len(), 12);
        assert!((onsets[0].time - (1.5 + 50.0 / FPS)).abs() < 1e-4);
    }

    #[test]
    fn consensus_requires_agreement_or_strength() {
        let low = [event(1.0, 0.35), event(2.0, 0.2)];
        let mid = [event(1.01, 0.32), event(3.0, 0.45)];
        let high = [event(4.0, 0.7), event(5.0, 0.25)];
        let fused = fuse_onsets_by_band_consensus(&low, &mid, &high);
        let times: Vec<f32> = fused.iter().map(|e| e.time).collect();

        // 1.0: two bands at mean 0.335; 3.0: mid alone 0.45; 4.0: strong high
        assert_eq!(fused.len(), 3);
        assert!((times[0] - 1.005).abs() < 0.01);
        assert_eq!(fused[0].band, None);
        assert!((times[1] - 3.0).abs() < 1e-6);
        assert_eq!(fused[1].band, Some(Band::Mid));
        assert!((times[2] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn refractory_keeps_the_stronger() {
        let low = [event(1.0, 0.7)];
        let high = [event(1.045, 0.9)];
        let fused = fuse_onsets_by_band_consensus(&low, &[], &high);
        assert_eq!(fused.len(), 1);
        assert!((fused[0].time - 1.045).abs() < 1e-6);
    }

    #[test]
    fn quantize_snaps_and_dedups() {
        let beat = BeatEstimate::new(120.0, 0.9, 0.1, BeatSource::Autocorrelation);
        let onsets = [
            event(0.12, 0.5),  // -> 0.1
            event(0.34, 0.4),  // -> 0.35 (half beat)
            event(0.36, 0.8),  // -> 0.35, stronger
            event(0.6, 0.3),   // -> 0.6
        ];
        let q = quantize_onsets(&onsets, &beat, 2.0);
        let times: Vec<f32> = q.iter().map(|e| e.time).collect();
        assert_eq!(q.len(), 3);
        assert!((times[0] - 0.1).abs() < 1e-5);
        assert!((times[1] - 0.35).abs() < 1e-5);
        assert!((q[1].strength - 0.8).abs() < 1e-6);
        assert!((times[2] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn flux_profile_sees_clicks() {
        let sr = 22050u32;
        let mut mono = vec![0.0f32; sr as usize * 3];
        for k in 0..6 {
            let start = (0.25 + 0.5 * k as f32) * sr as f32;
            for i in 0..2000 {
                let t = i as f32 / sr as f32;
                mono[start as usize + i] = (2.0 * std::f32::consts::PI * 1500.0 * t).sin()
                    * (-t * 60.0).exp();
            }
        }
        let mut ctx = AnalysisContext::new();
        let mut ticks = 0;
        let profile =
            compute_flux_profile(&mut ctx, &mono, sr, None, 1024, 256, &mut |_| ticks += 1)
                .unwrap();
        assert!(ticks > 0);
        assert_eq!(profile.len(), (mono.len() - 1024) / 256 + 1);
        assert_eq!(profile.low.len(), profile.mid_energy.len());

        let onsets = profile.detect(1.0);
        assert_eq!(onsets.len(), 6, "{:?}", onsets);
        for (k, onset) in onsets.iter().enumerate() {
            assert!((onset.time - (0.25 + 0.5 * k as f32)).abs() < 0.04);
        }
    }

    #[test]
    fn sub_range_offsets_frame_times() {
        let sr = 8000u32;
        let mono = vec![0.0f32; sr as usize * 4];
        let mut ctx = AnalysisContext::new();
        let range = TimeRange {
            start: 1.0,
            duration: 2.0,
        };
        let profile =
            compute_flux_profile(&mut ctx, &mono, sr, Some(range), 512, 128, &mut |_| {}).unwrap();
        assert!((profile.start_time - (1.0 + 256.0 / 8000.0)).abs() < 1e-5);
        assert_eq!(profile.len(), (16000 - 512) / 128 + 1);
        assert!(profile.detect(1.0).is_empty());
    }
}
