//! External tempo estimators consulted before the internal one.

use crossbeam_channel::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::features::{TempoHint, Waveform};

pub const DEFAULT_HINT_BUDGET: Duration = Duration::from_millis(300);

/// Bounded-time source of a tempo hint. Failures of any kind are `None`.
pub trait TempoHintProvider: Send {
    fn try_get_hint(&self, waveform: Arc<Waveform>) -> Option<TempoHint>;
}

pub struct NoHint;

impl TempoHintProvider for NoHint {
    fn try_get_hint(&self, _waveform: Arc<Waveform>) -> Option<TempoHint> {
        None
    }
}

/// A fixed hint, e.g. a BPM given on the command line.
pub struct StaticHint(pub TempoHint);

impl TempoHintProvider for StaticHint {
    fn try_get_hint(&self, _waveform: Arc<Waveform>) -> Option<TempoHint> {
        Some(self.0)
    }
}

/// Runs an estimator on a helper thread and waits at most `budget` for it.
///
/// A late estimator keeps running detached; its result is dropped.
pub struct TimedHint<F> {
    estimator: Arc<F>,
    budget: Duration,
}

impl<F> TimedHint<F>
where
    F: Fn(&Waveform) -> Option<TempoHint> + Send + Sync + 'static,
{
    pub fn new(estimator: F, budget: Duration) -> Self {
        Self {
            estimator: Arc::new(estimator),
            budget,
        }
    }
}

impl<F> TempoHintProvider for TimedHint<F>
where
    F: Fn(&Waveform) -> Option<TempoHint> + Send + Sync + 'static,
{
    fn try_get_hint(&self, waveform: Arc<Waveform>) -> Option<TempoHint> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let estimator = Arc::clone(&self.estimator);
        let spawned = std::thread::Builder::new()
            .name("tempo-hint".into())
            .spawn(move || {
                let _ = tx.send(estimator(&waveform));
            });
        if let Err(e) = spawned {
            log::warn!("Could not start tempo hint thread: {}", e);
            return None;
        }

        match rx.recv_timeout(self.budget) {
            Ok(hint) => hint,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Tempo hint not ready after {:?}, ignoring", self.budget);
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Tempo hint estimator failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waveform() -> Arc<Waveform> {
        Arc::new(Waveform::new(8000, vec![vec![0.0; 800]]).unwrap())
    }

    fn hint(bpm: f32) -> TempoHint {
        TempoHint {
            bpm,
            confidence: 0.8,
            first_beat_offset: 0.1,
        }
    }

    #[test]
    fn static_and_empty_providers() {
        assert_eq!(StaticHint(hint(128.0)).try_get_hint(waveform()), Some(hint(128.0)));
        assert_eq!(NoHint.try_get_hint(waveform()), None);
    }

    #[test]
    fn timed_hint_within_budget() {
        let provider = TimedHint::new(
            |wf: &Waveform| Some(hint(wf.sample_rate as f32 / 80.0)),
            Duration::from_secs(5),
        );
        assert_eq!(provider.try_get_hint(waveform()), Some(hint(100.0)));
    }

    #[test]
    fn slow_estimator_degrades_to_none() {
        let provider = TimedHint::new(
            |_: &Waveform| {
                std::thread::sleep(Duration::from_millis(500));
                Some(hint(128.0))
            },
            Duration::from_millis(20),
        );
        assert_eq!(provider.try_get_hint(waveform()), None);
    }

    #[test]
    fn panicking_estimator_degrades_to_none() {
        let provider = TimedHint::new(
            |_: &Waveform| -> Option<TempoHint> { panic!("estimator crashed") },
            Duration::from_secs(5),
        );
        assert_eq!(provider.try_get_hint(waveform()), None);
    }
}
