//! Grids and weights for averaging an integrand over an age-time rectangle.
//!
//! Integrands are often only piecewise smooth (the rates are piecewise linear
//! between smoothing grid points), so a low-order rule is used: the trapezoidal
//! rule in age, then in time. A uniform mean of the grid nodes is available as
//! the minimal alternative.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridError {
    #[error("{direction} grid is empty")]
    Empty { direction: &'static str },
    #[error("{direction} grid contains a non-finite point")]
    NonFinite { direction: &'static str },
    #[error("{direction} grid is not monotone non-decreasing at index {index}")]
    NotMonotone { direction: &'static str, index: usize },
    #[error("maximum {direction} step must be finite and positive, got {step}")]
    InvalidStep { direction: &'static str, step: f64 },
    #[error("{direction} partition would need {n} intervals, more than the limit of {limit}")]
    TooManyNodes {
        direction: &'static str,
        n: f64,
        limit: usize,
    },
}

/// Largest number of intervals a partition may have in one direction.
pub const MAX_INTERVALS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AverageRule {
    /// Trapezoidal weights in age, then in time.
    #[default]
    Trapezoidal,
    /// Arithmetic mean of every grid node.
    Uniform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AverageGrid {
    age: Vec<f64>,
    time: Vec<f64>,
}

impl AverageGrid {
    /// Equal partition of each direction with spacing at most the given step.
    /// A degenerate direction (`lower == upper`) has a single node.
    pub fn partition(
        age: (f64, f64),
        time: (f64, f64),
        max_age_step: f64,
        max_time_step: f64,
    ) -> Result<Self, GridError> {
        Ok(Self {
            age: partition_1d(age.0, age.1, max_age_step, "age")?,
            time: partition_1d(time.0, time.1, max_time_step, "time")?,
        })
    }

    /// Explicit grids; the first (last) point of each is the lower (upper)
    /// limit of the average.
    pub fn from_points(age: Vec<f64>, time: Vec<f64>) -> Result<Self, GridError> {
        check_points(&age, "age")?;
        check_points(&time, "time")?;
        Ok(Self { age, time })
    }

    pub fn age(&self) -> &[f64] {
        &self.age
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn n_nodes(&self) -> usize {
        self.age.len() * self.time.len()
    }

    /// Every `(age, time)` node paired with its weight; weights sum to one.
    pub fn weighted_nodes(&self, rule: AverageRule) -> Vec<(f64, f64, f64)> {
        let (age_weights, time_weights) = match rule {
            AverageRule::Trapezoidal => (trapezoid_weights(&self.age), trapezoid_weights(&self.time)),
            AverageRule::Uniform => (uniform_weights(self.age.len()), uniform_weights(self.time.len())),
        };
        itertools::iproduct!(
            self.time.iter().zip(time_weights.iter()),
            self.age.iter().zip(age_weights.iter())
        )
        .map(|((&t, &wt), (&a, &wa))| (a, t, wa * wt))
        .collect()
    }
}

fn partition_1d(
    lower: f64,
    upper: f64,
    max_step: f64,
    direction: &'static str,
) -> Result<Vec<f64>, GridError> {
    if !lower.is_finite() || !upper.is_finite() {
        return Err(GridError::NonFinite { direction });
    }
    if upper < lower {
        return Err(GridError::NotMonotone { direction, index: 1 });
    }
    if lower == upper {
        return Ok(vec![lower]);
    }
    if !max_step.is_finite() || max_step <= 0.0 {
        return Err(GridError::InvalidStep {
            direction,
            step: max_step,
        });
    }
    let n = ((upper - lower) / max_step).ceil().max(1.0);
    if n > MAX_INTERVALS as f64 {
        return Err(GridError::TooManyNodes {
            direction,
            n,
            limit: MAX_INTERVALS,
        });
    }
    let n_interval = n as usize;
    let step = (upper - lower) / n_interval as f64;
    let mut points: Vec<f64> = (0..n_interval).map(|k| lower + k as f64 * step).collect();
    points.push(upper);
    Ok(points)
}

fn check_points(points: &[f64], direction: &'static str) -> Result<(), GridError> {
    if points.is_empty() {
        return Err(GridError::Empty { direction });
    }
    if points.iter().any(|p| !p.is_finite()) {
        return Err(GridError::NonFinite { direction });
    }
    if let Some(index) = points.windows(2).position(|w| w[1] < w[0]) {
        return Err(GridError::NotMonotone {
            direction,
            index: index + 1,
        });
    }
    Ok(())
}

/// Normalized trapezoidal weights. A single point, or a grid of zero width,
/// falls back to equal weights.
fn trapezoid_weights(points: &[f64]) -> Vec<f64> {
    let n = points.len();
    let width = points[n - 1] - points[0];
    if n == 1 || width == 0.0 {
        return uniform_weights(n);
    }
    let mut weights = vec![0.0; n];
    for (k, w) in points.windows(2).enumerate() {
        let half = 0.5 * (w[1] - w[0]) / width;
        weights[k] += half;
        weights[k + 1] += half;
    }
    weights
}

fn uniform_weights(n: usize) -> Vec<f64> {
    vec![1.0 / n as f64; n]
}
