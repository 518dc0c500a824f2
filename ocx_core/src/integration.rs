//! Adaptive Runge-Kutta-Fehlberg 4(5) integration.
//!
//! Forward-only: callers integrating backward transform to a forward
//! variable first (the Riccati pass does exactly that). The integrator lands
//! exactly on the requested end time, reports accepted steps through an
//! observer, and surfaces divergence (step underflow, step-count overrun,
//! non-finite values) as a fatal error.

use nalgebra::DVector;

use crate::error::{OcxError, OcxResult};

/// Right-hand side of `dy/dt = f(t, y)`.
pub trait OdeSystem {
    fn derivative(&mut self, t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>);
}

impl<F> OdeSystem for F
where
    F: FnMut(f64, &DVector<f64>, &mut DVector<f64>),
{
    fn derivative(&mut self, t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>) {
        self(t, y, dydt)
    }
}

/// Embedded RKF45 stepper with proportional step control.
#[derive(Debug, Clone)]
pub struct AdaptiveIntegrator {
    pub abs_tol: f64,
    pub rel_tol: f64,
    pub max_steps: usize,
}

impl Default for AdaptiveIntegrator {
    fn default() -> Self {
        Self { abs_tol: 1e-9, rel_tol: 1e-6, max_steps: 100_000 }
    }
}

impl AdaptiveIntegrator {
    pub fn new(tol: f64, max_steps: usize) -> Self {
        Self { abs_tol: tol, rel_tol: tol.max(1e-12), max_steps }
    }

    /// Integrate from `(t0, y0)` to `tf`, calling `observe` at `t0` and at
    /// every accepted step. Returns the state at `tf`.
    pub fn integrate(
        &self,
        sys: &mut dyn OdeSystem,
        t0: f64,
        y0: DVector<f64>,
        tf: f64,
        mut observe: impl FnMut(f64, &DVector<f64>),
    ) -> OcxResult<DVector<f64>> {
        debug_assert!(tf >= t0, "integration runs forward");
        let span = tf - t0;
        let mut t = t0;
        let mut y = y0;
        observe(t, &y);
        if span <= 0.0 {
            return Ok(y);
        }

        let dim = y.len();
        let mut k = vec![DVector::zeros(dim); 6];
        let mut scratch = DVector::zeros(dim);
        let min_step = span * 1e-14;
        let mut h = (span / 100.0).min(span);
        let mut steps = 0usize;

        while t < tf {
            if steps >= self.max_steps {
                return Err(OcxError::IntegratorDiverged { time: t, reason: "step count exceeded" });
            }
            steps += 1;
            h = h.min(tf - t);

            self.stages(sys, t, &y, h, &mut k, &mut scratch);

            // 5th-order solution and embedded 4th-order error estimate.
            let mut y5 = y.clone();
            y5.axpy(h * 16.0 / 135.0, &k[0], 1.0);
            y5.axpy(h * 6656.0 / 12825.0, &k[2], 1.0);
            y5.axpy(h * 28561.0 / 56430.0, &k[3], 1.0);
            y5.axpy(h * -9.0 / 50.0, &k[4], 1.0);
            y5.axpy(h * 2.0 / 55.0, &k[5], 1.0);

            let mut err = 0.0f64;
            for i in 0..dim {
                let e = h
                    * (k[0][i] / 360.0 - 128.0 * k[2][i] / 4275.0 - 2197.0 * k[3][i] / 75240.0
                        + k[4][i] / 50.0
                        + 2.0 * k[5][i] / 55.0);
                let scale = self.abs_tol + self.rel_tol * y[i].abs().max(y5[i].abs());
                err = err.max((e / scale).abs());
            }

            if !y5.iter().all(|v| v.is_finite()) || !err.is_finite() {
                return Err(OcxError::IntegratorDiverged { time: t, reason: "non-finite state" });
            }

            if err <= 1.0 {
                t += h;
                // Snap to the end time once the residual is below resolution.
                if tf - t < min_step {
                    t = tf;
                }
                y = y5;
                observe(t, &y);
            }

            // Proportional controller, growth clamped to [0.2, 5.0].
            let factor = if err > 0.0 { (0.9 * err.powf(-0.2)).clamp(0.2, 5.0) } else { 5.0 };
            h *= factor;
            if h < min_step && t < tf {
                return Err(OcxError::IntegratorDiverged { time: t, reason: "step underflow" });
            }
        }
        Ok(y)
    }

    /// Integrate through a non-decreasing time grid, returning the state at
    /// every grid point (the first entry is `y0` itself). Zero-length
    /// intervals pass the state through unchanged.
    pub fn integrate_at(
        &self,
        sys: &mut dyn OdeSystem,
        times: &[f64],
        y0: DVector<f64>,
    ) -> OcxResult<Vec<DVector<f64>>> {
        debug_assert!(!times.is_empty());
        let mut out = Vec::with_capacity(times.len());
        let mut y = y0;
        out.push(y.clone());
        for w in times.windows(2) {
            if w[1] > w[0] {
                y = self.integrate(sys, w[0], y, w[1], |_, _| {})?;
            }
            out.push(y.clone());
        }
        Ok(out)
    }

    fn stages(
        &self,
        sys: &mut dyn OdeSystem,
        t: f64,
        y: &DVector<f64>,
        h: f64,
        k: &mut [DVector<f64>],
        scratch: &mut DVector<f64>,
    ) {
        const A: [[f64; 5]; 5] = [
            [0.25, 0.0, 0.0, 0.0, 0.0],
            [3.0 / 32.0, 9.0 / 32.0, 0.0, 0.0, 0.0],
            [1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0, 0.0, 0.0],
            [439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0, 0.0],
            [-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
        ];
        const C: [f64; 6] = [0.0, 0.25, 0.375, 12.0 / 13.0, 1.0, 0.5];

        sys.derivative(t, y, &mut k[0]);
        for s in 1..6 {
            scratch.copy_from(y);
            for (j, &coeff) in A[s - 1].iter().enumerate().take(s) {
                if coeff != 0.0 {
                    scratch.axpy(h * coeff, &k[j], 1.0);
                }
            }
            let mut ks = std::mem::take(&mut k[s]);
            sys.derivative(t + C[s] * h, scratch, &mut ks);
            k[s] = ks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exponential_decay() {
        let integrator = AdaptiveIntegrator::new(1e-10, 100_000);
        let mut sys = |_t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = -y[0];
        };
        let y = integrator
            .integrate(&mut sys, 0.0, DVector::from_vec(vec![1.0]), 2.0, |_, _| {})
            .unwrap();
        assert_relative_eq!(y[0], (-2.0f64).exp(), epsilon = 1e-8);
    }

    #[test]
    fn harmonic_oscillator_energy() {
        let integrator = AdaptiveIntegrator::new(1e-10, 100_000);
        let mut sys = |_t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = y[1];
            dydt[1] = -y[0];
        };
        let y = integrator
            .integrate(
                &mut sys,
                0.0,
                DVector::from_vec(vec![1.0, 0.0]),
                std::f64::consts::TAU,
                |_, _| {},
            )
            .unwrap();
        assert_relative_eq!(y[0], 1.0, epsilon = 1e-7);
        assert_relative_eq!(y[1], 0.0, epsilon = 1e-7);
    }

    #[test]
    fn grid_integration_passes_through_duplicates() {
        let integrator = AdaptiveIntegrator::new(1e-9, 100_000);
        let mut sys = |_t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = y[0];
        };
        let times = [0.0, 0.5, 0.5, 1.0];
        let out = integrator
            .integrate_at(&mut sys, &times, DVector::from_vec(vec![1.0]))
            .unwrap();
        assert_eq!(out.len(), 4);
        assert_relative_eq!(out[1][0], out[2][0]);
        assert_relative_eq!(out[3][0], 1.0f64.exp(), epsilon = 1e-7);
    }

    #[test]
    fn finite_time_blowup_is_fatal() {
        let integrator = AdaptiveIntegrator::new(1e-9, 10_000);
        let mut sys = |_t: f64, y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = y[0] * y[0];
        };
        // y' = y^2 from y(0) = 1 blows up at t = 1.
        let out = integrator.integrate(&mut sys, 0.0, DVector::from_vec(vec![1.0]), 2.0, |_, _| {});
        assert!(matches!(out, Err(OcxError::IntegratorDiverged { .. })));
    }

    #[test]
    fn observer_sees_monotone_times() {
        let integrator = AdaptiveIntegrator::default();
        let mut sys = |_t: f64, _y: &DVector<f64>, dydt: &mut DVector<f64>| {
            dydt[0] = 1.0;
        };
        let mut stamps = Vec::new();
        integrator
            .integrate(&mut sys, 0.0, DVector::zeros(1), 1.0, |t, _| stamps.push(t))
            .unwrap();
        assert_eq!(stamps[0], 0.0);
        assert_eq!(*stamps.last().unwrap(), 1.0);
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }
}
