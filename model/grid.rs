use crate::rates::RateFunction;
use ndarray::Array2;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GridFunctionError {
    #[error("grid values have shape {found:?} but the grid has {n_age} ages and {n_time} times")]
    ShapeMismatch {
        found: (usize, usize),
        n_age: usize,
        n_time: usize,
    },
    #[error("{direction} grid must be non-empty, finite and strictly increasing")]
    BadCoordinates { direction: &'static str },
}

/// A function of (age, time) given by its values on a rectangular grid.
///
/// Between grid points the value is bilinear; outside the grid it is held
/// constant at the nearest edge, so a single-point grid is a constant.
#[derive(Debug, Clone, PartialEq)]
pub struct GridFunction {
    age: Vec<f64>,
    time: Vec<f64>,
    values: Array2<f64>,
}

impl GridFunction {
    /// `values[[i, j]]` is the value at `(age[i], time[j])`.
    pub fn new(age: Vec<f64>, time: Vec<f64>, values: Array2<f64>) -> Result<Self, GridFunctionError> {
        check_axis(&age, "age")?;
        check_axis(&time, "time")?;
        if values.dim() != (age.len(), time.len()) {
            return Err(GridFunctionError::ShapeMismatch {
                found: values.dim(),
                n_age: age.len(),
                n_time: time.len(),
            });
        }
        Ok(Self { age, time, values })
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// A NaN coordinate gives a NaN value.
    pub fn evaluate(&self, age: f64, time: f64) -> f64 {
        if age.is_nan() || time.is_nan() {
            return f64::NAN;
        }
        let (i0, i1, wa) = bracket(&self.age, age);
        let (j0, j1, wt) = bracket(&self.time, time);
        let v = &self.values;
        let low = v[[i0, j0]] * (1.0 - wa) + v[[i1, j0]] * wa;
        let high = v[[i0, j1]] * (1.0 - wa) + v[[i1, j1]] * wa;
        low * (1.0 - wt) + high * wt
    }
}

impl RateFunction for GridFunction {
    #[inline]
    fn value(&self, age: f64, time: f64) -> f64 {
        self.evaluate(age, time)
    }
}

fn check_axis(points: &[f64], direction: &'static str) -> Result<(), GridFunctionError> {
    let ok = !points.is_empty()
        && points.iter().all(|p| p.is_finite())
        && points.windows(2).all(|w| w[0] < w[1]);
    if ok {
        Ok(())
    } else {
        Err(GridFunctionError::BadCoordinates { direction })
    }
}

/// Indices of the grid points on either side of `x` and the weight of the
/// upper one. Outside the grid both indices are the edge point.
fn bracket(points: &[f64], x: f64) -> (usize, usize, f64) {
    let last = points.len() - 1;
    if x <= points[0] {
        return (0, 0, 0.0);
    }
    if x >= points[last] {
        return (last, last, 0.0);
    }
    let upper = points.partition_point(|&p| p <= x);
    let lower = upper - 1;
    let weight = (x - points[lower]) / (points[upper] - points[lower]);
    (lower, upper, weight)
}
