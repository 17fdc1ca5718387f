//! Overlap-add FFT convolution with `valid` boundary handling.
//!
//! Kernel spectra are computed once at engine setup; each `peel` call then
//! streams the projected trace through fixed-size blocks. The kernels here
//! are the time-reversed temporal atoms of the low-rank factorization, so a
//! convolution below is a correlation against the template.

use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;
use std::sync::Arc;

const MIN_FFT_SIZE: usize = 64;

pub(crate) struct OaConvolver {
    kernel_len: usize,
    fft_size: usize,
    /// Number of fresh input samples consumed per block.
    segment_len: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    spectra: Vec<Vec<Complex<f32>>>,
}

impl OaConvolver {
    /// Plan FFTs and cache one spectrum per kernel. All kernels share
    /// `kernel_len`.
    pub fn new<'a, I>(kernels: I, kernel_len: usize) -> Self
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let fft_size = (4 * kernel_len).next_power_of_two().max(MIN_FFT_SIZE);
        let segment_len = fft_size - kernel_len + 1;

        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);

        let spectra = kernels
            .into_iter()
            .map(|kernel| {
                debug_assert_eq!(kernel.len(), kernel_len);
                let mut padded = vec![0.0; fft_size];
                padded[..kernel.len()].copy_from_slice(kernel);
                let mut spectrum = forward.make_output_vec();
                forward
                    .process(&mut padded, &mut spectrum)
                    .expect("kernel buffer length matches the plan");
                spectrum
            })
            .collect();

        Self {
            kernel_len,
            fft_size,
            segment_len,
            forward,
            inverse,
            spectra,
        }
    }

    pub fn num_kernels(&self) -> usize {
        self.spectra.len()
    }

    /// Add the `valid`-mode convolution of `signal` with kernel `index` into
    /// `out`, which must hold `signal.len() - kernel_len + 1` samples.
    pub fn accumulate_valid(&self, index: usize, signal: &[f32], out: &mut [f32]) {
        let num_timesteps = signal.len();
        debug_assert!(num_timesteps >= self.kernel_len);
        debug_assert_eq!(out.len(), num_timesteps - self.kernel_len + 1);

        let spectrum = &self.spectra[index];
        let mut full = vec![0.0_f32; num_timesteps + self.kernel_len - 1];
        let mut block = vec![0.0_f32; self.fft_size];
        let mut block_spectrum = self.forward.make_output_vec();
        let mut block_out = vec![0.0_f32; self.fft_size];
        let scale = 1.0 / self.fft_size as f32;

        let mut start = 0;
        while start < num_timesteps {
            let stop = (start + self.segment_len).min(num_timesteps);
            block[..stop - start].copy_from_slice(&signal[start..stop]);
            block[stop - start..].fill(0.0);

            self.forward
                .process(&mut block, &mut block_spectrum)
                .expect("block buffer length matches the plan");
            for (value, &kernel_value) in block_spectrum.iter_mut().zip(spectrum.iter()) {
                *value = *value * kernel_value * scale;
            }
            self.inverse
                .process(&mut block_spectrum, &mut block_out)
                .expect("spectrum buffer length matches the plan");

            let tail = full.len().min(start + self.fft_size);
            for (acc, &value) in full[start..tail].iter_mut().zip(block_out.iter()) {
                *acc += value;
            }
            start = stop;
        }

        for (acc, &value) in out.iter_mut().zip(full[self.kernel_len - 1..].iter()) {
            *acc += value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn direct_valid(signal: &[f32], kernel: &[f32]) -> Vec<f32> {
        let out_len = signal.len() - kernel.len() + 1;
        (0..out_len)
            .map(|p| {
                kernel
                    .iter()
                    .enumerate()
                    .map(|(j, &k)| k * signal[p + kernel.len() - 1 - j])
                    .sum()
            })
            .collect()
    }

    #[test]
    fn matches_direct_convolution() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let kernel_len = 31;
        let kernel: Vec<f32> = (0..kernel_len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let signal: Vec<f32> = (0..517).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let convolver = OaConvolver::new([kernel.as_slice()], kernel_len);
        let mut out = vec![0.0; signal.len() - kernel_len + 1];
        convolver.accumulate_valid(0, &signal, &mut out);

        let expected = direct_valid(&signal, &kernel);
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!(approx_eq!(f32, *a, *b, epsilon = 1e-3), "{a} vs {b}");
        }
    }

    #[test]
    fn accumulates_across_kernels() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let kernel_len = 8;
        let k1: Vec<f32> = (0..kernel_len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let k2: Vec<f32> = (0..kernel_len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let signal: Vec<f32> = (0..100).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let convolver = OaConvolver::new([k1.as_slice(), k2.as_slice()], kernel_len);
        let mut out = vec![0.0; signal.len() - kernel_len + 1];
        convolver.accumulate_valid(0, &signal, &mut out);
        convolver.accumulate_valid(1, &signal, &mut out);

        let mut expected = direct_valid(&signal, &k1);
        for (acc, v) in expected.iter_mut().zip(direct_valid(&signal, &k2)) {
            *acc += v;
        }
        for (a, b) in out.iter().zip(expected.iter()) {
            assert!(approx_eq!(f32, *a, *b, epsilon = 1e-3), "{a} vs {b}");
        }
    }
}
