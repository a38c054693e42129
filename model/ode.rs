//! Two-compartment cohort model.
//!
//! A cohort born at time `t - a` is followed from birth to age `a`. With the
//! substitution `s = age - a` the walk runs over `s in [-a, 0]` along the line
//! `time = age + (t - a)`:
//!
//! ```text
//! S'(s) = -(iota + omega) S(s) + rho C(s)
//! C'(s) =  iota S(s) - (rho + omega + chi) C(s)
//! ```
//!
//! with every rate evaluated at `(a + s, t + s)` and the initial condition
//! `S(-a) = 1 - pini(t - a)`, `C(-a) = pini(t - a)`.
//!
//! The system is linear, so [`CohortSystem::jacobian`] is simply the system
//! matrix at `s`. Three integrators are provided; all of them control the
//! absolute error of both components against `abs_tol`.

use crate::rates::{RatePoint, RateSet};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type Matrix2 = [[f64; 2]; 2];
type Vector2 = [f64; 2];

/// Largest step-size growth or shrink factor per step.
const MAX_STEP_FACTOR: f64 = 5.0;
const MIN_STEP_FACTOR: f64 = 0.2;
const SAFETY: f64 = 0.9;
/// First trial step as a fraction of the integration span.
const INITIAL_STEP_FRACTION: f64 = 1e-2;
/// Smallest allowed step as a fraction of the integration span.
const MIN_STEP_FRACTION: f64 = 1e-12;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OdeError {
    #[error("absolute tolerance must be finite and positive, got {0}")]
    InvalidTolerance(f64),
    #[error("step budget of {max_steps} exhausted at s = {s:.6e}")]
    StepLimit { max_steps: usize, s: f64 },
    #[error("step size underflow at s = {s:.6e} (h = {h:.3e}) while meeting the tolerance")]
    StepUnderflow { s: f64, h: f64 },
    #[error("compartment state became non-finite at s = {s:.6e}")]
    NonFinite { s: f64 },
}

/// Susceptible and with-condition probability mass of a cohort.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompartmentState {
    pub susceptible: f64,
    pub with_condition: f64,
}

impl CompartmentState {
    fn from_vector(y: Vector2) -> Self {
        Self {
            susceptible: y[0],
            with_condition: y[1],
        }
    }

    fn to_vector(self) -> Vector2 {
        [self.susceptible, self.with_condition]
    }

    /// `S + C`; the fraction of the cohort still alive.
    pub fn total(&self) -> f64 {
        self.susceptible + self.with_condition
    }

    /// `C / (S + C)`. Renormalizing removes any drift in the total.
    pub fn prevalence(&self) -> f64 {
        self.with_condition / self.total()
    }

    /// The state conditioned on survival; the components sum to one.
    pub fn conditional(&self) -> CompartmentState {
        let total = self.total();
        CompartmentState {
            susceptible: self.susceptible / total,
            with_condition: self.with_condition / total,
        }
    }
}

/// The cohort ODE for one evaluation point `(age, time)`.
///
/// Holds only a shared reference to the rates, so one system per data point
/// can be built on any worker thread.
#[derive(Debug, Clone, Copy)]
pub struct CohortSystem<'a> {
    rates: &'a RateSet,
    age: f64,
    time: f64,
}

impl<'a> CohortSystem<'a> {
    pub fn new(rates: &'a RateSet, age: f64, time: f64) -> Self {
        Self { rates, age, time }
    }

    pub fn age(&self) -> f64 {
        self.age
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Value of `s` at birth.
    pub fn start(&self) -> f64 {
        -self.age
    }

    pub fn initial_state(&self) -> CompartmentState {
        let pini = self.rates.initial_prevalence(self.time - self.age);
        CompartmentState {
            susceptible: 1.0 - pini,
            with_condition: pini,
        }
    }

    #[inline]
    fn rates_at(&self, s: f64) -> RatePoint {
        self.rates.point(self.age + s, self.time + s)
    }

    /// `d(S', C') / d(S, C)` at `s`.
    #[inline]
    pub fn jacobian(&self, s: f64) -> Matrix2 {
        system_matrix(self.rates_at(s))
    }

    #[inline]
    pub fn rhs(&self, s: f64, state: Vector2) -> Vector2 {
        mat_vec(&self.jacobian(s), state)
    }
}

fn system_matrix(rates: RatePoint) -> Matrix2 {
    let RatePoint {
        iota,
        rho,
        chi,
        omega,
    } = rates;
    [[-(iota + omega), rho], [iota, -(rho + omega + chi)]]
}

#[inline]
fn mat_vec(m: &Matrix2, y: Vector2) -> Vector2 {
    [m[0][0] * y[0] + m[0][1] * y[1], m[1][0] * y[0] + m[1][1] * y[1]]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OdeMethod {
    /// Adaptive explicit Runge-Kutta 4(5) pair.
    #[default]
    DormandPrince,
    /// Implicit trapezoidal rule with the explicit Jacobian; A-stable.
    Trapezoidal,
    /// Exact solution of the system with rates frozen at each step midpoint.
    Eigen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdeOptions {
    pub abs_tol: f64,
    pub max_steps: usize,
    pub method: OdeMethod,
}

impl OdeOptions {
    pub const DEFAULT_MAX_STEPS: usize = 100_000;

    pub fn new(abs_tol: f64, method: OdeMethod) -> Self {
        Self {
            abs_tol,
            max_steps: Self::DEFAULT_MAX_STEPS,
            method,
        }
    }

    fn validate(&self) -> Result<(), OdeError> {
        if !self.abs_tol.is_finite() || self.abs_tol <= 0.0 {
            return Err(OdeError::InvalidTolerance(self.abs_tol));
        }
        Ok(())
    }
}

/// Integrates the cohort from birth to the evaluation age and returns the
/// state at `s = 0`.
pub fn solve(system: &CohortSystem<'_>, options: &OdeOptions) -> Result<CompartmentState, OdeError> {
    options.validate()?;
    let initial = system.initial_state();
    if negligible_interval(system, options.abs_tol) {
        return Ok(initial);
    }

    let y0 = initial.to_vector();
    let y = match options.method {
        OdeMethod::DormandPrince => dormand_prince(system, y0, options)?,
        OdeMethod::Trapezoidal => step_doubling(system, y0, options, 2, trapezoidal_step)?,
        OdeMethod::Eigen => step_doubling(system, y0, options, 2, eigen_step)?,
    };
    Ok(CompartmentState::from_vector(y))
}

/// The rates change the state by less than the tolerance over the whole
/// cohort; this also covers evaluation at age zero.
///
/// Rates are sampled only at birth and at the evaluation point. A rate that
/// vanishes at both ends but not in between is treated as negligible, so a
/// hump-shaped rate must be non-zero at one of the ends to be integrated.
fn negligible_interval(system: &CohortSystem<'_>, abs_tol: f64) -> bool {
    let age = system.age();
    if age == 0.0 {
        return true;
    }
    let scale = system
        .rates_at(0.0)
        .max_abs()
        .max(system.rates_at(system.start()).max_abs());
    (10.0 * scale * age).abs() < abs_tol
}

fn check_finite(y: Vector2, s: f64) -> Result<(), OdeError> {
    if y.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(OdeError::NonFinite { s })
    }
}

/// Max-norm of a local error estimate in units of the tolerance; infinite
/// when any component is not finite.
fn scaled_error(error: Vector2, abs_tol: f64) -> f64 {
    if error.iter().all(|e| e.is_finite()) {
        error[0].abs().max(error[1].abs()) / abs_tol
    } else {
        f64::INFINITY
    }
}

fn next_step_factor(err: f64, order: i32) -> f64 {
    if err == 0.0 {
        MAX_STEP_FACTOR
    } else {
        (SAFETY * err.powf(-1.0 / f64::from(order + 1))).clamp(MIN_STEP_FACTOR, MAX_STEP_FACTOR)
    }
}

fn dormand_prince(
    system: &CohortSystem<'_>,
    y0: Vector2,
    options: &OdeOptions,
) -> Result<Vector2, OdeError> {
    const A21: f64 = 1.0 / 5.0;
    const A31: f64 = 3.0 / 40.0;
    const A32: f64 = 9.0 / 40.0;
    const A41: f64 = 44.0 / 45.0;
    const A42: f64 = -56.0 / 15.0;
    const A43: f64 = 32.0 / 9.0;
    const A51: f64 = 19372.0 / 6561.0;
    const A52: f64 = -25360.0 / 2187.0;
    const A53: f64 = 64448.0 / 6561.0;
    const A54: f64 = -212.0 / 729.0;
    const A61: f64 = 9017.0 / 3168.0;
    const A62: f64 = -355.0 / 33.0;
    const A63: f64 = 46732.0 / 5247.0;
    const A64: f64 = 49.0 / 176.0;
    const A65: f64 = -5103.0 / 18656.0;

    // fifth-order weights advance the solution
    const B1: f64 = 35.0 / 384.0;
    const B3: f64 = 500.0 / 1113.0;
    const B4: f64 = 125.0 / 192.0;
    const B5: f64 = -2187.0 / 6784.0;
    const B6: f64 = 11.0 / 84.0;

    // difference between the fifth and embedded fourth order weights
    const E1: f64 = 71.0 / 57600.0;
    const E3: f64 = -71.0 / 16695.0;
    const E4: f64 = 71.0 / 1920.0;
    const E5: f64 = -17253.0 / 339200.0;
    const E6: f64 = 22.0 / 525.0;
    const E7: f64 = -1.0 / 40.0;

    let end = 0.0;
    let mut s = system.start();
    let span = end - s;
    let h_min = span * MIN_STEP_FRACTION;
    let mut h = span * INITIAL_STEP_FRACTION;
    let mut y = y0;
    let mut k1 = system.rhs(s, y);
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    let combine = |y: Vector2, h: f64, terms: &[(f64, Vector2)]| -> Vector2 {
        let mut out = y;
        for (weight, k) in terms {
            out[0] += h * weight * k[0];
            out[1] += h * weight * k[1];
        }
        out
    };

    while accepted + rejected < options.max_steps {
        let last = h >= end - s;
        if last {
            h = end - s;
        }

        let k2 = system.rhs(s + h / 5.0, combine(y, h, &[(A21, k1)]));
        let k3 = system.rhs(s + 3.0 * h / 10.0, combine(y, h, &[(A31, k1), (A32, k2)]));
        let k4 = system.rhs(
            s + 4.0 * h / 5.0,
            combine(y, h, &[(A41, k1), (A42, k2), (A43, k3)]),
        );
        let k5 = system.rhs(
            s + 8.0 * h / 9.0,
            combine(y, h, &[(A51, k1), (A52, k2), (A53, k3), (A54, k4)]),
        );
        let k6 = system.rhs(
            s + h,
            combine(y, h, &[(A61, k1), (A62, k2), (A63, k3), (A64, k4), (A65, k5)]),
        );
        let y_new = combine(y, h, &[(B1, k1), (B3, k3), (B4, k4), (B5, k5), (B6, k6)]);
        let k7 = system.rhs(s + h, y_new);

        let error = combine(
            [0.0, 0.0],
            h,
            &[(E1, k1), (E3, k3), (E4, k4), (E5, k5), (E6, k6), (E7, k7)],
        );
        let err = scaled_error(error, options.abs_tol);
        if !err.is_finite() {
            return Err(OdeError::NonFinite { s });
        }

        if err <= 1.0 {
            s = if last { end } else { s + h };
            y = y_new;
            k1 = k7;
            accepted += 1;
            log::trace!("dormand-prince step accepted: s = {s:.6}, h = {h:.3e}, err = {err:.3}");
            if last {
                check_finite(y, s)?;
                log::debug!(
                    "cohort ode (dormand-prince) age {:.4}: {accepted} accepted, {rejected} rejected steps",
                    system.age()
                );
                return Ok(y);
            }
        } else {
            rejected += 1;
        }

        h *= next_step_factor(err, 4);
        if h < h_min {
            return Err(OdeError::StepUnderflow { s, h });
        }
    }

    log::warn!(
        "cohort ode (dormand-prince) stopped at s = {s:.6} after {} steps",
        options.max_steps
    );
    Err(OdeError::StepLimit {
        max_steps: options.max_steps,
        s,
    })
}

/// Adaptive driver for one-step methods of known order: each step is taken
/// once with `h` and twice with `h / 2`, the difference estimates the local
/// error, and the accepted value is Richardson-extrapolated.
fn step_doubling<F>(
    system: &CohortSystem<'_>,
    y0: Vector2,
    options: &OdeOptions,
    order: i32,
    step: F,
) -> Result<Vector2, OdeError>
where
    F: Fn(&CohortSystem<'_>, f64, f64, Vector2) -> Vector2,
{
    let end = 0.0;
    let mut s = system.start();
    let span = end - s;
    let h_min = span * MIN_STEP_FRACTION;
    let mut h = span * INITIAL_STEP_FRACTION;
    let mut y = y0;
    let denominator = f64::from(2_i32.pow(order as u32) - 1);
    let mut accepted = 0usize;
    let mut rejected = 0usize;

    while accepted + rejected < options.max_steps {
        let last = h >= end - s;
        if last {
            h = end - s;
        }

        let full = step(system, s, h, y);
        let half = step(system, s, h / 2.0, y);
        let double = step(system, s + h / 2.0, h / 2.0, half);
        let correction = [
            (double[0] - full[0]) / denominator,
            (double[1] - full[1]) / denominator,
        ];
        let err = scaled_error(correction, options.abs_tol);
        if !err.is_finite() {
            return Err(OdeError::NonFinite { s });
        }

        if err <= 1.0 {
            s = if last { end } else { s + h };
            y = [double[0] + correction[0], double[1] + correction[1]];
            accepted += 1;
            log::trace!("step-doubling step accepted: s = {s:.6}, h = {h:.3e}, err = {err:.3}");
            if last {
                check_finite(y, s)?;
                log::debug!(
                    "cohort ode (step doubling) age {:.4}: {accepted} accepted, {rejected} rejected steps",
                    system.age()
                );
                return Ok(y);
            }
        } else {
            rejected += 1;
        }

        h *= next_step_factor(err, order);
        if h < h_min {
            return Err(OdeError::StepUnderflow { s, h });
        }
    }

    log::warn!(
        "cohort ode (step doubling) stopped at s = {s:.6} after {} steps",
        options.max_steps
    );
    Err(OdeError::StepLimit {
        max_steps: options.max_steps,
        s,
    })
}

/// `(I - h/2 J(s + h)) y1 = (I + h/2 J(s)) y0`, solved directly for the 2x2 case.
fn trapezoidal_step(system: &CohortSystem<'_>, s: f64, h: f64, y: Vector2) -> Vector2 {
    let j0 = system.jacobian(s);
    let j1 = system.jacobian(s + h);
    let slope = mat_vec(&j0, y);
    let rhs = [y[0] + 0.5 * h * slope[0], y[1] + 0.5 * h * slope[1]];

    let m00 = 1.0 - 0.5 * h * j1[0][0];
    let m01 = -0.5 * h * j1[0][1];
    let m10 = -0.5 * h * j1[1][0];
    let m11 = 1.0 - 0.5 * h * j1[1][1];
    let det = m00 * m11 - m01 * m10;
    [
        (m11 * rhs[0] - m01 * rhs[1]) / det,
        (m00 * rhs[1] - m10 * rhs[0]) / det,
    ]
}

fn eigen_step(system: &CohortSystem<'_>, s: f64, h: f64, y: Vector2) -> Vector2 {
    let b = system.jacobian(s + 0.5 * h);
    matrix_exp_apply(&b, y, h)
}

/// `(exp(t (b1 - b2)) - 1) / (b1 - b2)`, continuous through `b1 == b2`.
fn exp_difference(b1: f64, b2: f64, t: f64) -> f64 {
    let d = b1 - b2;
    if d == 0.0 { t } else { (d * t).exp_m1() / d }
}

/// `exp(t B) y` for a constant 2x2 matrix `B`.
///
/// Handles the diagonal and both triangular structures separately; the general
/// case diagonalizes with left eigenvectors `(1, u)`, `u = (lambda - b00) / b10`.
pub(crate) fn matrix_exp_apply(b: &Matrix2, y: Vector2, t: f64) -> Vector2 {
    let [[b00, b01], [b10, b11]] = *b;
    if b01 == 0.0 && b10 == 0.0 {
        return [y[0] * (b00 * t).exp(), y[1] * (b11 * t).exp()];
    }
    if b01 == 0.0 {
        let y0 = y[0] * (b00 * t).exp();
        let y1 = (b11 * t).exp() * (y[1] + b10 * y[0] * exp_difference(b00, b11, t));
        return [y0, y1];
    }
    if b10 == 0.0 {
        let y1 = y[1] * (b11 * t).exp();
        let y0 = (b00 * t).exp() * (y[0] + b01 * y[1] * exp_difference(b11, b00, t));
        return [y0, y1];
    }

    let disc = (b00 - b11) * (b00 - b11) + 4.0 * b01 * b10;
    let root = disc.sqrt();
    let lambda_plus = 0.5 * (b00 + b11 + root);
    let lambda_minus = 0.5 * (b00 + b11 - root);
    let u_plus = (lambda_plus - b00) / b10;
    let u_minus = (lambda_minus - b00) / b10;
    let z_plus = (y[0] + u_plus * y[1]) * (lambda_plus * t).exp();
    let z_minus = (y[0] + u_minus * y[1]) * (lambda_minus * t).exp();
    let y1 = (z_plus - z_minus) * b10 / root;
    let y0 = z_plus - u_plus * y1;
    [y0, y1]
}
