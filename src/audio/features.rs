use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Content key for a waveform. Two waveforms with the same sample rate,
/// channel layout and sample bits share an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WaveformId(u64);

impl WaveformId {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    fn of(sample_rate: u32, channels: &[Vec<f32>]) -> Self {
        let mut hash = Self::FNV_OFFSET;
        let mut feed = |bytes: &[u8]| {
            for &b in bytes {
                hash ^= b as u64;
                hash = hash.wrapping_mul(Self::FNV_PRIME);
            }
        };
        feed(&sample_rate.to_le_bytes());
        feed(&(channels.len() as u32).to_le_bytes());
        for channel in channels {
            feed(&(channel.len() as u64).to_le_bytes());
            for s in channel {
                feed(&s.to_bits().to_le_bytes());
            }
        }
        WaveformId(hash)
    }
}

/// Decoded audio, one sample array per channel. Immutable once built.
#[derive(Clone, Debug)]
pub struct Waveform {
    id: WaveformId,
    pub sample_rate: u32,
    pub length: usize,
    pub duration: f32,
    pub channels: Vec<Vec<f32>>,
}

impl Waveform {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Result<Self> {
        if sample_rate == 0 {
            return Err(AnalysisError::InvalidWaveform("sample rate is zero".into()));
        }
        if channels.is_empty() {
            return Err(AnalysisError::InvalidWaveform("no channels".into()));
        }
        let length = channels[0].len();
        if let Some(bad) = channels.iter().position(|c| c.len() != length) {
            return Err(AnalysisError::InvalidWaveform(format!(
                "channel {} has {} samples, expected {}",
                bad,
                channels[bad].len(),
                length
            )));
        }

        Ok(Self {
            id: WaveformId::of(sample_rate, &channels),
            sample_rate,
            length,
            duration: length as f32 / sample_rate as f32,
            channels,
        })
    }

    pub fn id(&self) -> WaveformId {
        self.id
    }

    /// Average of all channels.
    pub fn downmix(&self) -> Vec<f32> {
        if self.channels.len() == 1 {
            return self.channels[0].clone();
        }
        let scale = 1.0 / self.channels.len() as f32;
        (0..self.length)
            .map(|i| self.channels.iter().map(|c| c[i]).sum::<f32>() * scale)
            .collect()
    }
}

/// Frequency band an onset was picked from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    Low,
    Mid,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OnsetEvent {
    /// Seconds from the start of the track
    pub time: f32,
    /// 0.0-1.0
    pub strength: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band: Option<Band>,
}

/// Where a beat estimate came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BeatSource {
    Hint,
    Autocorrelation,
    Fallback,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatEstimate {
    pub bpm: f32,
    pub confidence: f32,
    /// Seconds per beat
    pub beat_interval: f32,
    /// Seconds to the first beat
    pub first_beat_offset: f32,
    pub source: BeatSource,
}

impl BeatEstimate {
    pub fn new(bpm: f32, confidence: f32, first_beat_offset: f32, source: BeatSource) -> Self {
        Self {
            bpm,
            confidence,
            beat_interval: 60.0 / bpm,
            first_beat_offset,
            source,
        }
    }

    pub fn fallback() -> Self {
        Self::new(120.0, 0.3, 0.0, BeatSource::Fallback)
    }
}

/// Tempo supplied by an external estimator.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TempoHint {
    pub bpm: f32,
    pub confidence: f32,
    pub first_beat_offset: f32,
}

/// Spectral features at one time point. Scores are 0.0-1.0; band energies are raw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct SpectralProfile {
    pub time: f32,
    pub low: f32,
    pub mid: f32,
    pub high: f32,
    pub total: f32,
    pub brightness: f32,
    pub transient: f32,
    pub tonal: f32,
    pub percussive: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EnergySample {
    pub time: f32,
    pub energy: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Intro,
    Verse,
    Chorus,
    Drop,
    Bridge,
    Interlude,
    Outro,
}

impl SectionType {
    pub const ALL: [SectionType; 7] = [
        SectionType::Intro,
        SectionType::Verse,
        SectionType::Chorus,
        SectionType::Drop,
        SectionType::Bridge,
        SectionType::Interlude,
        SectionType::Outro,
    ];

    /// Sections that carry the bulk of the gameplay.
    pub fn is_playable(self) -> bool {
        !matches!(
            self,
            SectionType::Intro | SectionType::Outro | SectionType::Interlude
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            SectionType::Intro => "intro",
            SectionType::Verse => "verse",
            SectionType::Chorus => "chorus",
            SectionType::Drop => "drop",
            SectionType::Bridge => "bridge",
            SectionType::Interlude => "interlude",
            SectionType::Outro => "outro",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionInfo {
    pub start: f32,
    pub end: f32,
    pub kind: SectionType,
    pub avg_energy: f32,
    pub interlude: bool,
}

impl SectionInfo {
    pub fn len(&self) -> f32 {
        self.end - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_ragged_channels() {
        let err = Waveform::new(44100, vec![vec![0.0; 10], vec![0.0; 9]]);
        assert!(err.is_err());
        assert!(Waveform::new(0, vec![vec![0.0; 10]]).is_err());
        assert!(Waveform::new(44100, vec![]).is_err());
    }

    #[test]
    fn downmix_averages_channels() {
        let wf = Waveform::new(8000, vec![vec![1.0, 0.0, -1.0], vec![0.0, 1.0, -1.0]]).unwrap();
        assert_eq!(wf.downmix(), vec![0.5, 0.5, -1.0]);
        assert_eq!(wf.length, 3);
    }

    #[test]
    fn id_follows_content() {
        let a = Waveform::new(8000, vec![vec![0.1, 0.2, 0.3]]).unwrap();
        let b = Waveform::new(8000, vec![vec![0.1, 0.2, 0.3]]).unwrap();
        let c = Waveform::new(8000, vec![vec![0.1, 0.2, 0.4]]).unwrap();
        let d = Waveform::new(16000, vec![vec![0.1, 0.2, 0.3]]).unwrap();
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_ne!(a.id(), d.id());
    }
}
