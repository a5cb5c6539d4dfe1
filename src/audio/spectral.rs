use super::context::AnalysisContext;
use super::features::SpectralProfile;
use crate::error::Result;

const BANDS_HZ: [(f32, f32); 3] = [(20.0, 250.0), (250.0, 2000.0), (2000.0, 20000.0)];
const SILENCE: f32 = 1e-10;

/// Band energies of the previous point; the only state carried between points.
#[derive(Clone, Copy, Default)]
struct PrevBands {
    low: f32,
    mid: f32,
    high: f32,
    total: f32,
}

/// Spectral features for each requested time point, in order.
pub fn profile_points(
    ctx: &mut AnalysisContext,
    mono: &[f32],
    sample_rate: u32,
    times: &[f32],
    frame_size: usize,
) -> Result<Vec<SpectralProfile>> {
    let window = ctx.window_of(frame_size);
    let sr = sample_rate as f32;
    let half = frame_size / 2;
    let bin_hz = sr / frame_size as f32;
    let bins: Vec<(usize, usize)> = BANDS_HZ
        .iter()
        .map(|&(lo, hi)| {
            let lo = ((lo / bin_hz).ceil() as usize).clamp(1, half);
            let hi = ((hi / bin_hz).ceil() as usize).clamp(lo, half);
            (lo, hi)
        })
        .collect();
    let norm = 1.0 / (frame_size as f32 * frame_size as f32);

    let mut re = vec![0.0f32; frame_size];
    let mut im = vec![0.0f32; frame_size];
    let mut prev: Option<PrevBands> = None;
    let mut out = Vec::with_capacity(times.len());

    for &time in times {
        let center = (time.max(0.0) * sr) as usize;
        let start = center.saturating_sub(half);
        re.fill(0.0);
        im.fill(0.0);
        for (i, r) in re.iter_mut().enumerate() {
            match mono.get(start + i) {
                Some(&s) => *r = s * window[i],
                None => break,
            }
        }
        ctx.transform(&mut re, &mut im)?;

        let band_energy = |(lo, hi): (usize, usize)| -> f32 {
            (lo..hi).map(|k| re[k] * re[k] + im[k] * im[k]).sum::<f32>() * norm
        };
        let bands = PrevBands {
            low: band_energy(bins[0]),
            mid: band_energy(bins[1]),
            high: band_energy(bins[2]),
            total: 0.0,
        };
        let bands = PrevBands {
            total: bands.low + bands.mid + bands.high,
            ..bands
        };

        out.push(describe(time, bands, prev));
        prev = Some(bands);
    }

    Ok(out)
}

fn rise(cur: f32, prev: f32) -> f32 {
    if cur <= SILENCE {
        0.0
    } else {
        ((cur - prev).max(0.0) / cur).min(1.0)
    }
}

fn describe(time: f32, cur: PrevBands, prev: Option<PrevBands>) -> SpectralProfile {
    let transient = prev.map_or(0.0, |p| {
        (0.5 * rise(cur.total, p.total)
            + 0.3 * rise(cur.high, p.high)
            + 0.15 * rise(cur.mid, p.mid)
            + 0.05 * rise(cur.low, p.low))
        .clamp(0.0, 1.0)
    });

    let mut profile = SpectralProfile {
        time,
        low: cur.low,
        mid: cur.mid,
        high: cur.high,
        total: cur.total,
        transient,
        percussive: (0.45 * transient).clamp(0.0, 1.0),
        ..Default::default()
    };
    if cur.total <= SILENCE {
        return profile;
    }

    let low_share = cur.low / cur.total;
    let mid_share = cur.mid / cur.total;
    let high_share = cur.high / cur.total;

    profile.brightness = (0.4 * mid_share + high_share).clamp(0.0, 1.0);
    profile.tonal = (0.6 * mid_share
        + 0.25 * (1.0 - (low_share - high_share).abs())
        + 0.15 * (1.0 - transient))
        .clamp(0.0, 1.0);
    profile.percussive = (0.55 * high_share + 0.45 * transient).clamp(0.0, 1.0);
    profile
}
