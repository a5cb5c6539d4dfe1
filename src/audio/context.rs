use std::collections::HashMap;
use std::sync::Arc;

use super::features::{Waveform, WaveformId};
use super::fft::TransformPlan;
use crate::error::Result;

/// Memoized inputs shared by the analysis stages of one worker.
///
/// Every cache is append-only. A context belongs to a single thread; run
/// several workers with one context each.
#[derive(Default)]
pub struct AnalysisContext {
    plans: HashMap<usize, Arc<TransformPlan>>,
    windows: HashMap<usize, Arc<[f32]>>,
    mono: HashMap<WaveformId, Arc<[f32]>>,
}

impl AnalysisContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mono downmix of `waveform`, computed once per waveform content.
    pub fn mono_of(&mut self, waveform: &Waveform) -> Arc<[f32]> {
        self.mono
            .entry(waveform.id())
            .or_insert_with(|| {
                log::debug!(
                    "Downmixing {} channel(s), {} samples",
                    waveform.channels.len(),
                    waveform.length
                );
                waveform.downmix().into()
            })
            .clone()
    }

    /// Symmetric Hann window of `size` coefficients.
    pub fn window_of(&mut self, size: usize) -> Arc<[f32]> {
        self.windows
            .entry(size)
            .or_insert_with(|| hann_window(size).into())
            .clone()
    }

    pub fn plan_of(&mut self, size: usize) -> Result<Arc<TransformPlan>> {
        if let Some(plan) = self.plans.get(&size) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(TransformPlan::new(size)?);
        self.plans.insert(size, plan.clone());
        Ok(plan)
    }

    /// Forward transform using the cached plan for `re.len()`.
    pub fn transform(&mut self, re: &mut [f32], im: &mut [f32]) -> Result<()> {
        self.plan_of(re.len())?.forward(re, im)
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_is_computed_once_per_waveform() {
        let mut ctx = AnalysisContext::new();
        let wf = Waveform::new(8000, vec![vec![1.0, 3.0], vec![3.0, 1.0]]).unwrap();
        let a = ctx.mono_of(&wf);
        let b = ctx.mono_of(&wf.clone());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(&a[..], &[2.0, 2.0]);
    }

    #[test]
    fn window_is_symmetric_and_cached() {
        let mut ctx = AnalysisContext::new();
        let w = ctx.window_of(1024);
        assert_eq!(w.len(), 1024);
        for i in 0..512 {
            assert!((w[i] - w[1023 - i]).abs() < 1e-6);
        }
        assert!(w[0].abs() < 1e-6);
        assert!(Arc::ptr_eq(&w, &ctx.window_of(1024)));
    }

    #[test]
    fn plans_are_shared_and_validated() {
        let mut ctx = AnalysisContext::new();
        let a = ctx.plan_of(256).unwrap();
        let b = ctx.plan_of(256).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(ctx.plan_of(300).is_err());

        let mut re = vec![0.0; 300];
        let mut im = vec![0.0; 300];
        assert!(ctx.transform(&mut re, &mut im).is_err());
    }
}
