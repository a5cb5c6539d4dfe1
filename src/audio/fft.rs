//! Iterative radix-2 decimation-in-time transform.

use std::f64::consts::PI;

use crate::error::{AnalysisError, Result};

/// Twiddle factors for one butterfly stage (stage length `2 * cos.len()`).
#[derive(Debug)]
struct Twiddles {
    cos: Vec<f32>,
    sin: Vec<f32>,
}

/// Precomputed tables for one transform size.
#[derive(Debug)]
pub struct TransformPlan {
    size: usize,
    bit_reverse: Vec<usize>,
    stages: Vec<Twiddles>,
}

impl TransformPlan {
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 || !size.is_power_of_two() {
            return Err(AnalysisError::TransformSize(size));
        }

        let bits = size.trailing_zeros();
        let bit_reverse = (0..size)
            .map(|i| if bits == 0 { 0 } else { i.reverse_bits() >> (usize::BITS - bits) })
            .collect();

        let mut stages = Vec::with_capacity(bits as usize);
        let mut len = 2;
        while len <= size {
            let half = len / 2;
            let step = -2.0 * PI / len as f64;
            stages.push(Twiddles {
                cos: (0..half).map(|k| (step * k as f64).cos() as f32).collect(),
                sin: (0..half).map(|k| (step * k as f64).sin() as f32).collect(),
            });
            len *= 2;
        }

        Ok(Self {
            size,
            bit_reverse,
            stages,
        })
    }

    /// In-place forward transform. No normalization is applied.
    pub fn forward(&self, re: &mut [f32], im: &mut [f32]) -> Result<()> {
        if re.len() != im.len() || re.len() != self.size {
            return Err(AnalysisError::LengthMismatch {
                re: re.len(),
                im: im.len(),
                plan: self.size,
            });
        }

        for (i, &j) in self.bit_reverse.iter().enumerate() {
            if i < j {
                re.swap(i, j);
                im.swap(i, j);
            }
        }

        let mut len = 2;
        for stage in &self.stages {
            let half = len / 2;
            for start in (0..self.size).step_by(len) {
                for k in 0..half {
                    let (wr, wi) = (stage.cos[k], stage.sin[k]);
                    let a = start + k;
                    let b = a + half;
                    let tr = re[b] * wr - im[b] * wi;
                    let ti = re[b] * wi + im[b] * wr;
                    re[b] = re[a] - tr;
                    im[b] = im[a] - ti;
                    re[a] += tr;
                    im[a] += ti;
                }
            }
            len *= 2;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rustfft::{num_complex::Complex, FftPlanner};

    fn power(re: &[f32], im: &[f32]) -> Vec<f32> {
        re.iter().zip(im).map(|(r, i)| r * r + i * i).collect()
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(matches!(TransformPlan::new(0), Err(AnalysisError::TransformSize(0))));
        assert!(matches!(TransformPlan::new(1000), Err(AnalysisError::TransformSize(1000))));
        assert!(TransformPlan::new(1024).is_ok());
    }

    #[test]
    fn rejects_mismatched_buffers() {
        let plan = TransformPlan::new(8).unwrap();
        let mut re = vec![1.0; 8];
        let mut im = vec![0.0; 4];
        assert!(plan.forward(&mut re, &mut im).is_err());
        // Untouched on failure
        assert!(re.iter().all(|&v| v == 1.0));

        let mut re = vec![1.0; 16];
        let mut im = vec![0.0; 16];
        assert!(plan.forward(&mut re, &mut im).is_err());
    }

    #[test]
    fn bit_reverse_is_an_involution() {
        for size in [1usize, 2, 8, 256, 1024] {
            let plan = TransformPlan::new(size).unwrap();
            let table = &plan.bit_reverse;
            let mut seen = vec![false; size];
            for (i, &j) in table.iter().enumerate() {
                assert!(j < size);
                assert_eq!(table[j], i);
                seen[j] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn bin_aligned_sine_has_one_dominant_bin() {
        let n = 256;
        let bin = 19;
        let plan = TransformPlan::new(n).unwrap();
        let mut re: Vec<f32> = (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * bin as f32 * i as f32 / n as f32).sin())
            .collect();
        let mut im = vec![0.0; n];
        plan.forward(&mut re, &mut im).unwrap();

        let p = power(&re, &im);
        let peak = p[..n / 2]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, bin);
        for (k, &v) in p[..n / 2].iter().enumerate() {
            if k != bin {
                assert!(v < p[bin] * 1e-6, "bin {} leaked {}", k, v);
            }
        }
    }

    #[test]
    fn matches_reference_transform() {
        let n = 512;
        let signal: Vec<f32> = (0..n)
            .map(|i| ((i * 7919) % 101) as f32 / 50.0 - 1.0)
            .collect();

        let plan = TransformPlan::new(n).unwrap();
        let mut re = signal.clone();
        let mut im = vec![0.0; n];
        plan.forward(&mut re, &mut im).unwrap();

        let mut reference: Vec<Complex<f32>> =
            signal.iter().map(|&s| Complex::new(s, 0.0)).collect();
        FftPlanner::new().plan_fft_forward(n).process(&mut reference);

        for k in 0..n {
            assert_relative_eq!(re[k], reference[k].re, epsilon = 1e-2);
            assert_relative_eq!(im[k], reference[k].im, epsilon = 1e-2);
        }
    }
}
