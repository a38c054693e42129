use approx::assert_abs_diff_eq;
use disrate::config::ForwardConfig;
use disrate::forward::{ForwardError, ForwardIntegrand, ForwardOptions};
use disrate::integrand::{BoundsProblem, Integrand, IntegrandRequest};
use disrate::ode::OdeMethod;
use disrate::rates::{Rate, RateSet};
use std::io::Write;

const METHODS: [OdeMethod; 3] = [OdeMethod::DormandPrince, OdeMethod::Trapezoidal, OdeMethod::Eigen];

fn forward(method: OdeMethod) -> ForwardIntegrand {
    ForwardIntegrand::new(ForwardOptions {
        method,
        ..ForwardOptions::default()
    })
}

fn example_rates() -> RateSet {
    RateSet::zero()
        .with_constant(Rate::Iota, 0.01)
        .with_constant(Rate::Rho, 0.2)
        .with_constant(Rate::Chi, 0.3)
        .with_constant(Rate::Omega, 0.02)
}

/// Classic fourth order Runge-Kutta on the cohort ODE with constant rates and
/// no initial prevalence; returns (S, C) at `age`.
fn rk4_reference(iota: f64, rho: f64, chi: f64, omega: f64, age: f64) -> (f64, f64) {
    let f = |y: [f64; 2]| {
        [
            -(iota + omega) * y[0] + rho * y[1],
            iota * y[0] - (rho + omega + chi) * y[1],
        ]
    };
    let n_step = 50_000;
    let h = age / n_step as f64;
    let mut y = [1.0, 0.0];
    for _ in 0..n_step {
        let k1 = f(y);
        let k2 = f([y[0] + 0.5 * h * k1[0], y[1] + 0.5 * h * k1[1]]);
        let k3 = f([y[0] + 0.5 * h * k2[0], y[1] + 0.5 * h * k2[1]]);
        let k4 = f([y[0] + h * k3[0], y[1] + h * k3[1]]);
        for i in 0..2 {
            y[i] += h / 6.0 * (k1[i] + 2.0 * k2[i] + 2.0 * k3[i] + k4[i]);
        }
    }
    (y[0], y[1])
}

#[test]
fn zero_mortality_prevalence_has_closed_form() {
    let rates = RateSet::zero()
        .with_constant(Rate::Iota, 0.01)
        .with_constant(Rate::Pini, 0.0);
    let expected = 1.0 - (-0.5f64).exp();
    for method in METHODS {
        let prevalence = forward(method)
            .evaluate_point(&rates, Integrand::Prevalence, 50.0, 2000.0, 1e-10)
            .unwrap();
        assert_abs_diff_eq!(prevalence, expected, epsilon = 1e-6);
        assert_abs_diff_eq!(prevalence, 0.3935, epsilon = 1e-4);
    }
}

#[test]
fn incidence_is_followed_along_the_cohort() {
    // iota grows with calendar time; a cohort aged 40 in 2000 was born in 1960,
    // so the integral of iota over its life is 0.0002 * (10 * 40 + 40^2 / 2)
    let rates = RateSet::zero().with(Rate::Iota, |_: f64, time: f64| 0.0002 * (time - 1950.0));
    let expected = 1.0 - (-0.24f64).exp();
    for method in METHODS {
        let prevalence = forward(method)
            .evaluate_point(&rates, Integrand::Prevalence, 40.0, 2000.0, 1e-10)
            .unwrap();
        assert_abs_diff_eq!(prevalence, expected, epsilon = 1e-6);
    }
}

#[test]
fn compartments_are_conserved_without_mortality() {
    let rates = RateSet::zero()
        .with(Rate::Iota, |age: f64, _: f64| 0.001 * age)
        .with_constant(Rate::Rho, 0.1)
        .with(Rate::Pini, |_: f64, time: f64| 0.01 * (time - 1900.0) / 100.0);
    let abs_tol = 1e-8;
    for method in METHODS {
        let forward = forward(method);
        for age in [0.0, 1.0, 35.0, 90.0] {
            let s = forward
                .evaluate_point(&rates, Integrand::Susceptible, age, 2010.0, abs_tol)
                .unwrap();
            let c = forward
                .evaluate_point(&rates, Integrand::WithC, age, 2010.0, abs_tol)
                .unwrap();
            assert_abs_diff_eq!(s + c, 1.0, epsilon = abs_tol);
        }
    }
}

#[test]
fn direct_rates_pass_through_exactly() {
    let rates = RateSet::zero()
        .with(Rate::Iota, |age: f64, time: f64| 1e-3 * age + (time / 1000.0).sin())
        .with(Rate::Pini, |_: f64, _: f64| f64::NAN);
    let forward = ForwardIntegrand::default();
    for (age, time) in [(0.0, 1990.0), (12.5, 2001.0), (97.0, 2020.0)] {
        let expected = rates.value(Rate::Iota, age, time);
        let got = forward
            .evaluate(&rates, &IntegrandRequest::point(Integrand::Sincidence, age, time), 1e-8)
            .unwrap();
        assert_eq!(got, expected);
    }
}

#[test]
fn example_scenario_matches_reference_integration() {
    let rates = example_rates();
    let (s, c) = rk4_reference(0.01, 0.2, 0.3, 0.02, 50.0);
    let reference = c / (s + c);
    for method in METHODS {
        let forward = forward(method);
        let value = |integrand| {
            forward
                .evaluate_point(&rates, integrand, 50.0, 2000.0, 1e-10)
                .unwrap()
        };
        assert_eq!(value(Integrand::Remission), 0.2);
        assert_eq!(value(Integrand::MtExcess), 0.3);
        assert_eq!(value(Integrand::MtOther), 0.02);

        let prevalence = value(Integrand::Prevalence);
        assert!(prevalence > 0.0 && prevalence < 1.0);
        assert_abs_diff_eq!(prevalence, reference, epsilon = 1e-6);
        assert_abs_diff_eq!(value(Integrand::Susceptible), s, epsilon = 1e-6);
        assert_abs_diff_eq!(value(Integrand::WithC), c, epsilon = 1e-6);
    }
}

#[test]
fn point_contract_rejects_intervals() {
    let forward = ForwardIntegrand::default();
    let rates = example_rates();
    let request = IntegrandRequest::rectangle(Integrand::Remission, (10.0, 20.0), (2000.0, 2000.0));
    match forward.evaluate(&rates, &request, 1e-8) {
        Err(ForwardError::InvalidBounds {
            age_lower,
            age_upper,
            problem,
            ..
        }) => {
            assert_eq!((age_lower, age_upper), (10.0, 20.0));
            assert_eq!(problem, BoundsProblem::NotAPoint);
        }
        other => panic!("expected invalid bounds, got {other:?}"),
    }
    // the same rectangle is fine to average
    assert_eq!(forward.average(&rates, &request, 1e-8).unwrap(), 0.2);

    let reversed = IntegrandRequest::rectangle(Integrand::Remission, (20.0, 10.0), (2000.0, 2000.0));
    assert!(matches!(
        forward.average(&rates, &reversed, 1e-8),
        Err(ForwardError::InvalidBounds {
            problem: BoundsProblem::AgeReversed,
            ..
        })
    ));
}

#[test]
fn averaged_prevalence_matches_the_mean_of_the_closed_form() {
    let iota = 0.02;
    let rates = RateSet::zero().with_constant(Rate::Iota, iota);
    let forward = ForwardIntegrand::new(ForwardOptions {
        max_age_step: 0.5,
        ..ForwardOptions::default()
    });
    let request = IntegrandRequest::rectangle(Integrand::Prevalence, (20.0, 40.0), (2000.0, 2005.0));
    let avg = forward.average(&rates, &request, 1e-10).unwrap();
    // mean of 1 - exp(-iota a) over [20, 40]
    let exact = 1.0 - ((-iota * 20.0f64).exp() - (-iota * 40.0f64).exp()) / (iota * 20.0);
    assert_abs_diff_eq!(avg, exact, epsilon = 1e-4);
}

#[test]
fn forward_config_file_drives_a_batch() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
abs_tol = 1e-10

[options]
method = "eigen"

[rates]
iota = 0.01

[[request]]
integrand = "prevalence"
age = 50.0
time = 2000.0

[[request]]
integrand = "Sincidence"
age = [0.0, 100.0]
time = [1990.0, 2010.0]

[[request]]
integrand = "mtall"
age = -1.0
time = 2000.0
"#
    )
    .unwrap();

    let config = ForwardConfig::load(file.path()).unwrap();
    assert_eq!(config.options.method, OdeMethod::Eigen);
    let results = ForwardIntegrand::new(config.options).evaluate_batch(
        &config.rates.to_rate_set(),
        &config.requests(),
        config.abs_tol,
    );
    assert_eq!(results.len(), 3);
    assert_abs_diff_eq!(*results[0].as_ref().unwrap(), 1.0 - (-0.5f64).exp(), epsilon = 1e-6);
    assert_abs_diff_eq!(*results[1].as_ref().unwrap(), 0.01, epsilon = 1e-15);
    assert!(matches!(
        results[2],
        Err(ForwardError::InvalidBounds {
            problem: BoundsProblem::NegativeAge,
            ..
        })
    ));
}

#[test]
fn missing_config_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = ForwardConfig::load(dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().starts_with("Failed to read configuration file"));
}
