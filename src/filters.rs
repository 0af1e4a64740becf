//! This module contains the digital filters used by the control loops: a PT1
//! (first-order RC) low-pass, and a small FIR shift register used for the
//! noise-robust D-term differentiator.

use core::f32::consts::TAU;

/// First-order low-pass. The RC constant is derived lazily from the cutoff on
/// first use, so a reset (which zeroes RC) picks up a changed cutoff.
#[derive(Clone, Copy, Default)]
pub struct Pt1Filter {
    pub state: f32,
    rc: f32,
}

impl Pt1Filter {
    pub fn apply(&mut self, input: f32, cutoff_hz: f32, dt: f32) -> f32 {
        if self.rc == 0. {
            self.rc = 1. / (TAU * cutoff_hz);
        }

        self.state += dt / (self.rc + dt) * (input - self.state);
        self.state
    }

    pub fn reset(&mut self, value: f32) {
        self.state = value;
        self.rc = 0.;
    }
}

/// Fixed-length FIR delay line. `update` shifts the newest sample in at index 0;
/// `apply` is the dot product with the coefficient set, times an output gain.
#[derive(Clone, Copy)]
pub struct FirFilter<const N: usize> {
    buf: [f32; N],
}

impl<const N: usize> Default for FirFilter<N> {
    fn default() -> Self {
        Self { buf: [0.; N] }
    }
}

impl<const N: usize> FirFilter<N> {
    pub fn update(&mut self, input: f32) {
        let mut i = N - 1;
        while i > 0 {
            self.buf[i] = self.buf[i - 1];
            i -= 1;
        }
        self.buf[0] = input;
    }

    pub fn apply(&self, coeffs: &[f32; N], gain: f32) -> f32 {
        let mut result = 0.;
        for i in 0..N {
            result += self.buf[i] * coeffs[i];
        }
        result * gain
    }

    pub fn reset(&mut self) {
        self.buf = [0.; N];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f32 = 1e-5;

    #[test]
    fn pt1_converges_to_dc_input() {
        let mut filter = Pt1Filter::default();

        let mut out = 0.;
        for _ in 0..10_000 {
            out = filter.apply(10., 5., 0.001);
        }
        assert!((out - 10.).abs() < 0.01);
    }

    #[test]
    fn pt1_single_step_matches_rc_formula() {
        let mut filter = Pt1Filter::default();
        let dt = 0.01;
        let rc = 1. / (TAU * 4.);

        let out = filter.apply(1., 4., dt);
        assert!((out - dt / (rc + dt)).abs() < TOLERANCE);
    }

    #[test]
    fn pt1_reset_seeds_state() {
        let mut filter = Pt1Filter::default();
        filter.apply(5., 2., 0.01);
        filter.reset(3.);
        assert_eq!(filter.state, 3.);
    }

    #[test]
    fn fir_recovers_slope_of_a_ramp() {
        // Holoborodko 5-point coefficients differentiate a clean ramp exactly.
        let coeffs = [5., 2., -8., -2., 3.];
        let mut fir = FirFilter::<5>::default();

        let dt = 0.001;
        let slope = 40.; // units per second
        for n in 0..20 {
            fir.update(n as f32 * dt * slope);
        }
        // Raw weighted sum of the newest-first buffer is 8 * (per-sample step).
        let derivative = fir.apply(&coeffs, 1. / (8. * dt));
        assert!((derivative - slope).abs() < 1e-2);

        // The rate PID uses a negative gain so D opposes a rising gyro rate.
        let d_term = fir.apply(&coeffs, -1. / (8. * dt));
        assert!((d_term + slope).abs() < 1e-2);
    }
}
