use crate::average::{AverageGrid, AverageRule, GridError};
use crate::integrand::{BoundsProblem, Integrand, IntegrandRequest};
use crate::ode::{self, CohortSystem, CompartmentState, OdeError, OdeMethod, OdeOptions};
use crate::rates::{RatePoint, RateSet};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ForwardError {
    #[error(
        "invalid bounds: age [{age_lower}, {age_upper}], time [{time_lower}, {time_upper}]: {problem}"
    )]
    InvalidBounds {
        age_lower: f64,
        age_upper: f64,
        time_lower: f64,
        time_upper: f64,
        problem: BoundsProblem,
    },
    #[error("absolute tolerance must be finite and positive, got {0}")]
    InvalidTolerance(f64),
    #[error("cohort integration failed at age {age}, time {time}: {source}")]
    Integration {
        age: f64,
        time: f64,
        source: OdeError,
    },
    #[error("averaging grid: {0}")]
    InvalidGrid(#[from] GridError),
}

impl ForwardError {
    fn bounds(request: &IntegrandRequest, problem: BoundsProblem) -> Self {
        ForwardError::InvalidBounds {
            age_lower: request.age_lower,
            age_upper: request.age_upper,
            time_lower: request.time_lower,
            time_upper: request.time_upper,
            problem,
        }
    }
}

/// Integrator and averaging settings shared by every evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardOptions {
    pub method: OdeMethod,
    pub max_steps: usize,
    /// Largest age spacing of the grid used by [`ForwardIntegrand::average`].
    pub max_age_step: f64,
    /// Largest time spacing of the grid used by [`ForwardIntegrand::average`].
    pub max_time_step: f64,
    pub rule: AverageRule,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            method: OdeMethod::default(),
            max_steps: OdeOptions::DEFAULT_MAX_STEPS,
            max_age_step: 5.0,
            max_time_step: 5.0,
            rule: AverageRule::default(),
        }
    }
}

/// Evaluates integrands from a [`RateSet`], at a point or averaged over an
/// age-time rectangle.
///
/// Holds no per-evaluation state; one instance can serve every worker thread.
#[derive(Debug, Clone, Default)]
pub struct ForwardIntegrand {
    options: ForwardOptions,
}

impl ForwardIntegrand {
    pub fn new(options: ForwardOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ForwardOptions {
        &self.options
    }

    /// Point evaluation. The request must have `age_lower == age_upper` and
    /// `time_lower == time_upper`.
    ///
    /// Direct-rate integrands are returned without solving the ODE.
    /// `relrisk` and `mtstandard` divide by mortality without a guard, so a
    /// zero denominator yields an IEEE infinity or NaN rather than an error.
    pub fn evaluate(
        &self,
        rates: &RateSet,
        request: &IntegrandRequest,
        abs_tol: f64,
    ) -> Result<f64, ForwardError> {
        check_tolerance(abs_tol)?;
        request
            .check_bounds()
            .map_err(|problem| ForwardError::bounds(request, problem))?;
        if !request.is_point() {
            return Err(ForwardError::bounds(request, BoundsProblem::NotAPoint));
        }
        self.point_value(rates, request.integrand, request.age_lower, request.time_lower, abs_tol)
    }

    pub fn evaluate_point(
        &self,
        rates: &RateSet,
        integrand: Integrand,
        age: f64,
        time: f64,
        abs_tol: f64,
    ) -> Result<f64, ForwardError> {
        self.evaluate(rates, &IntegrandRequest::point(integrand, age, time), abs_tol)
    }

    /// Average over the request rectangle on an equal partition whose spacing
    /// does not exceed the configured maximum steps. A point request averages
    /// to its point value.
    pub fn average(
        &self,
        rates: &RateSet,
        request: &IntegrandRequest,
        abs_tol: f64,
    ) -> Result<f64, ForwardError> {
        check_tolerance(abs_tol)?;
        request
            .check_bounds()
            .map_err(|problem| ForwardError::bounds(request, problem))?;
        let grid = AverageGrid::partition(
            (request.age_lower, request.age_upper),
            (request.time_lower, request.time_upper),
            self.options.max_age_step,
            self.options.max_time_step,
        )?;
        self.average_on(rates, request.integrand, &grid, abs_tol)
    }

    /// Average on an explicit grid with the configured rule.
    pub fn average_on(
        &self,
        rates: &RateSet,
        integrand: Integrand,
        grid: &AverageGrid,
        abs_tol: f64,
    ) -> Result<f64, ForwardError> {
        check_tolerance(abs_tol)?;
        let age = grid.age();
        let time = grid.time();
        if age[0] < 0.0 {
            let request = IntegrandRequest::rectangle(
                integrand,
                (age[0], age[age.len() - 1]),
                (time[0], time[time.len() - 1]),
            );
            return Err(ForwardError::bounds(&request, BoundsProblem::NegativeAge));
        }

        let mut sum = 0.0;
        for (a, t, weight) in grid.weighted_nodes(self.options.rule) {
            sum += weight * self.point_value(rates, integrand, a, t, abs_tol)?;
        }
        log::trace!("{integrand} averaged over {} nodes: {sum}", grid.n_nodes());
        Ok(sum)
    }

    /// Evaluates every request in parallel: point requests with
    /// [`evaluate`](Self::evaluate), rectangles with [`average`](Self::average).
    /// Results are in request order; one failure does not stop the others.
    pub fn evaluate_batch(
        &self,
        rates: &RateSet,
        requests: &[IntegrandRequest],
        abs_tol: f64,
    ) -> Vec<Result<f64, ForwardError>> {
        let results: Vec<_> = requests
            .par_iter()
            .map(|request| {
                if request.is_point() {
                    self.evaluate(rates, request, abs_tol)
                } else {
                    self.average(rates, request, abs_tol)
                }
            })
            .collect();
        let failed = results.iter().filter(|r| r.is_err()).count();
        log::debug!("evaluated {} integrand requests, {failed} failed", results.len());
        results
    }

    fn point_value(
        &self,
        rates: &RateSet,
        integrand: Integrand,
        age: f64,
        time: f64,
        abs_tol: f64,
    ) -> Result<f64, ForwardError> {
        let point = rates.point(age, time);
        integrand_value(integrand, point, || {
            let system = CohortSystem::new(rates, age, time);
            let options = OdeOptions {
                abs_tol,
                max_steps: self.options.max_steps,
                method: self.options.method,
            };
            ode::solve(&system, &options).map_err(|source| {
                log::warn!("{integrand} at age {age}, time {time}: {source}");
                ForwardError::Integration { age, time, source }
            })
        })
    }
}

fn check_tolerance(abs_tol: f64) -> Result<(), ForwardError> {
    if abs_tol.is_finite() && abs_tol > 0.0 {
        Ok(())
    } else {
        Err(ForwardError::InvalidTolerance(abs_tol))
    }
}

/// The integrand at one point. `state` is only called for integrands that
/// need the compartment state.
fn integrand_value<F>(integrand: Integrand, rates: RatePoint, state: F) -> Result<f64, ForwardError>
where
    F: FnOnce() -> Result<CompartmentState, ForwardError>,
{
    let RatePoint {
        iota,
        rho,
        chi,
        omega,
    } = rates;
    let value = match integrand {
        Integrand::Sincidence | Integrand::Incidence => iota,
        Integrand::Remission => rho,
        Integrand::MtExcess => chi,
        Integrand::MtOther => omega,
        Integrand::MtWith => omega + chi,
        Integrand::RelRisk => (omega + chi) / omega,
        Integrand::Susceptible => state()?.susceptible,
        Integrand::WithC => state()?.with_condition,
        Integrand::Prevalence => state()?.prevalence(),
        Integrand::Tincidence => iota * (1.0 - state()?.prevalence()),
        Integrand::MtSpecific => chi * state()?.prevalence(),
        Integrand::MtAll => omega + chi * state()?.prevalence(),
        Integrand::MtStandard => {
            let prevalence = state()?.prevalence();
            (omega + chi) / (omega + chi * prevalence)
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::Rate;
    use approx::assert_abs_diff_eq;

    fn example_rates() -> RateSet {
        RateSet::zero()
            .with_constant(Rate::Iota, 0.01)
            .with_constant(Rate::Rho, 0.2)
            .with_constant(Rate::Chi, 0.3)
            .with_constant(Rate::Omega, 0.02)
    }

    #[test]
    fn direct_integrands_never_solve_the_ode() {
        // a pini that would make the ode fail is never touched
        let rates = example_rates().with_constant(Rate::Pini, f64::NAN);
        let forward = ForwardIntegrand::default();
        let expected = [
            (Integrand::Sincidence, 0.01),
            (Integrand::Incidence, 0.01),
            (Integrand::Remission, 0.2),
            (Integrand::MtExcess, 0.3),
            (Integrand::MtOther, 0.02),
            (Integrand::MtWith, 0.32),
            (Integrand::RelRisk, 0.32 / 0.02),
        ];
        for (integrand, value) in expected {
            let got = forward
                .evaluate_point(&rates, integrand, 50.0, 2000.0, 1e-8)
                .unwrap();
            assert_eq!(got, value, "{integrand}");
        }
    }

    #[test]
    fn ode_integrands_are_consistent_with_each_other() {
        let rates = example_rates();
        let forward = ForwardIntegrand::default();
        let value = |integrand| {
            forward
                .evaluate_point(&rates, integrand, 50.0, 2000.0, 1e-10)
                .unwrap()
        };
        let s = value(Integrand::Susceptible);
        let c = value(Integrand::WithC);
        let p = value(Integrand::Prevalence);
        assert_abs_diff_eq!(p, c / (s + c), epsilon = 1e-12);
        assert_abs_diff_eq!(value(Integrand::Tincidence), 0.01 * (1.0 - p), epsilon = 1e-12);
        assert_abs_diff_eq!(value(Integrand::MtSpecific), 0.3 * p, epsilon = 1e-12);
        assert_abs_diff_eq!(value(Integrand::MtAll), 0.02 + 0.3 * p, epsilon = 1e-12);
        assert_abs_diff_eq!(
            value(Integrand::MtStandard),
            0.32 / (0.02 + 0.3 * p),
            epsilon = 1e-10
        );
    }

    #[test]
    fn zero_mortality_divisions_propagate_ieee_values() {
        let rates = RateSet::zero().with_constant(Rate::Iota, 0.01);
        let forward = ForwardIntegrand::default();
        let relrisk = forward
            .evaluate_point(&rates, Integrand::RelRisk, 30.0, 2000.0, 1e-8)
            .unwrap();
        assert!(relrisk.is_nan());

        let rates = rates.with_constant(Rate::Chi, 0.1);
        let relrisk = forward
            .evaluate_point(&rates, Integrand::RelRisk, 30.0, 2000.0, 1e-8)
            .unwrap();
        assert_eq!(relrisk, f64::INFINITY);

        let rates = RateSet::zero();
        let mtstandard = forward
            .evaluate_point(&rates, Integrand::MtStandard, 30.0, 2000.0, 1e-8)
            .unwrap();
        assert!(mtstandard.is_nan());
    }

    #[test]
    fn non_point_request_is_rejected_for_point_evaluation() {
        let forward = ForwardIntegrand::default();
        let request = IntegrandRequest::rectangle(Integrand::Prevalence, (40.0, 50.0), (2000.0, 2000.0));
        let err = forward.evaluate(&example_rates(), &request, 1e-8).unwrap_err();
        assert!(matches!(
            err,
            ForwardError::InvalidBounds {
                problem: BoundsProblem::NotAPoint,
                ..
            }
        ));

        let request = IntegrandRequest::point(Integrand::Prevalence, -1.0, 2000.0);
        let err = forward.evaluate(&example_rates(), &request, 1e-8).unwrap_err();
        assert!(matches!(
            err,
            ForwardError::InvalidBounds {
                problem: BoundsProblem::NegativeAge,
                ..
            }
        ));
    }

    #[test]
    fn tolerance_must_be_positive() {
        let forward = ForwardIntegrand::default();
        let err = forward
            .evaluate_point(&example_rates(), Integrand::Remission, 1.0, 2000.0, 0.0)
            .unwrap_err();
        assert_eq!(err, ForwardError::InvalidTolerance(0.0));
    }

    #[test]
    fn integrator_failure_carries_the_evaluation_point() {
        let forward = ForwardIntegrand::new(ForwardOptions {
            max_steps: 2,
            ..ForwardOptions::default()
        });
        let err = forward
            .evaluate_point(&example_rates(), Integrand::Prevalence, 80.0, 2000.0, 1e-12)
            .unwrap_err();
        match err {
            ForwardError::Integration { age, time, source } => {
                assert_eq!((age, time), (80.0, 2000.0));
                assert!(matches!(source, OdeError::StepLimit { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn average_of_a_point_request_is_the_point_value() {
        let forward = ForwardIntegrand::default();
        let rates = example_rates();
        let request = IntegrandRequest::point(Integrand::Prevalence, 45.0, 2005.0);
        let point = forward.evaluate(&rates, &request, 1e-10).unwrap();
        let average = forward.average(&rates, &request, 1e-10).unwrap();
        assert_eq!(point, average);
    }

    #[test]
    fn average_of_age_linear_rate_is_its_midpoint_value() {
        let rates = RateSet::zero().with(Rate::Omega, |a: f64, t: f64| 0.001 * a + 1e-4 * (t - 2000.0));
        let forward = ForwardIntegrand::new(ForwardOptions {
            max_age_step: 1.0,
            max_time_step: 1.0,
            ..ForwardOptions::default()
        });
        let request = IntegrandRequest::rectangle(Integrand::MtOther, (20.0, 40.0), (2000.0, 2010.0));
        let avg = forward.average(&rates, &request, 1e-8).unwrap();
        assert_abs_diff_eq!(avg, 0.001 * 30.0 + 1e-4 * 5.0, epsilon = 1e-14);
    }

    #[test]
    fn oversized_average_grid_is_an_error() {
        let forward = ForwardIntegrand::new(ForwardOptions {
            max_age_step: 1e-300,
            ..ForwardOptions::default()
        });
        let request = IntegrandRequest::rectangle(Integrand::Sincidence, (0.0, 10.0), (2000.0, 2000.0));
        assert!(matches!(
            forward.average(&example_rates(), &request, 1e-8),
            Err(ForwardError::InvalidGrid(GridError::TooManyNodes { direction: "age", .. }))
        ));
    }

    #[test]
    fn batch_matches_sequential_evaluation() {
        let rates = example_rates();
        let forward = ForwardIntegrand::default();
        let requests: Vec<_> = (0..12)
            .map(|k| {
                let integrand = Integrand::ALL[k % Integrand::ALL.len()];
                if k % 3 == 0 {
                    IntegrandRequest::rectangle(integrand, (k as f64, k as f64 + 7.0), (1990.0, 2000.0))
                } else {
                    IntegrandRequest::point(integrand, 5.0 * k as f64, 2000.0)
                }
            })
            .collect();
        let batch = forward.evaluate_batch(&rates, &requests, 1e-9);
        for (request, result) in requests.iter().zip(batch) {
            let expected = if request.is_point() {
                forward.evaluate(&rates, request, 1e-9)
            } else {
                forward.average(&rates, request, 1e-9)
            };
            assert_eq!(result, expected);
        }
    }
}
