//! Turning a packed vector back into rate functions.
//!
//! Parent rates are the bilinear interpolant of their smoothing grid values.
//! A child's rate is the parent rate times `exp` of the child's random effect,
//! both interpolated on their own grids. Covariate multipliers are not applied
//! here; they need covariate values that belong to individual data rows.

use super::packer::{Node, PackError, SubvecInfo, VariablePacker};
use super::vars::PackedVars;
use crate::grid::GridFunction;
use crate::rates::{Rate, RateFunction, RateSet, RateSlot};
use std::sync::Arc;

/// Parent rate scaled by a child random effect.
#[derive(Debug, Clone)]
struct ChildRate {
    parent: GridFunction,
    effect: GridFunction,
}

impl RateFunction for ChildRate {
    fn value(&self, age: f64, time: f64) -> f64 {
        self.parent.evaluate(age, time) * self.effect.evaluate(age, time).exp()
    }
}

/// The bilinear interpolant of one block; `None` for an empty block.
pub fn grid_function(
    packer: &VariablePacker,
    vars: &PackedVars,
    info: SubvecInfo,
) -> Result<Option<GridFunction>, PackError> {
    let Some(smooth_id) = info.smooth_id else {
        return Ok(None);
    };
    let smoothing = packer.smoothing(smooth_id)?;
    let (age, time) = smoothing
        .coordinates()
        .ok_or(PackError::MissingCoordinates { smooth_id })?;
    let values = vars.grid(info, smoothing.n_time)?.to_owned();
    Ok(Some(GridFunction::new(age.to_vec(), time.to_vec(), values)?))
}

/// Rates of the parent or of one child node.
///
/// A rate without a parent smoothing stays not modeled. A child without a
/// child smoothing uses the parent rate unchanged.
pub fn decode_rates(
    packer: &VariablePacker,
    vars: &PackedVars,
    node: Node,
) -> Result<RateSet, PackError> {
    if vars.len() != packer.size() {
        return Err(PackError::LengthMismatch {
            expected: packer.size(),
            found: vars.len(),
        });
    }
    let mut rates = RateSet::zero();
    for rate in Rate::ALL {
        let parent_info = packer.rate_info(rate, Node::Parent)?;
        let Some(parent) = grid_function(packer, vars, parent_info)? else {
            continue;
        };
        let effect = match node {
            Node::Parent => None,
            Node::Child(_) => grid_function(packer, vars, packer.rate_info(rate, node)?)?,
        };
        let function: Arc<dyn RateFunction> = match effect {
            Some(effect) => Arc::new(ChildRate { parent, effect }),
            None => Arc::new(parent),
        };
        rates.set(rate, RateSlot::Function(function));
    }
    log::trace!("decoded rates for {node}");
    Ok(rates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{ModelStructure, RateSmoothing, SmoothingGrid};
    use approx::assert_abs_diff_eq;

    fn structure() -> ModelStructure {
        ModelStructure {
            n_integrand: 0,
            n_child: 2,
            smoothing: vec![
                SmoothingGrid::with_coordinates("iota", vec![0.0, 100.0], vec![2000.0]),
                SmoothingGrid::with_coordinates("effect", vec![0.0], vec![2000.0]),
                SmoothingGrid::with_coordinates("pini", vec![0.0], vec![1900.0, 2100.0]),
            ],
            mulcov: Vec::new(),
            rate: vec![
                RateSmoothing {
                    rate: Rate::Iota,
                    parent_smooth_id: Some(0),
                    child_smooth_id: Some(1),
                },
                RateSmoothing {
                    rate: Rate::Pini,
                    parent_smooth_id: Some(2),
                    child_smooth_id: None,
                },
            ],
        }
    }

    fn filled(packer: &VariablePacker) -> PackedVars {
        let mut vars = PackedVars::zeros(packer);
        let write = |vars: &mut PackedVars, info: SubvecInfo, values: &[f64]| {
            for (slot, value) in vars.block_mut(info).unwrap().iter_mut().zip(values) {
                *slot = *value;
            }
        };
        write(&mut vars, packer.rate_info(Rate::Iota, Node::Parent).unwrap(), &[0.01, 0.03]);
        write(&mut vars, packer.rate_info(Rate::Iota, Node::Child(1)).unwrap(), &[0.5]);
        write(&mut vars, packer.rate_info(Rate::Pini, Node::Parent).unwrap(), &[0.0, 0.2]);
        vars
    }

    #[test]
    fn parent_rates_interpolate_grid_values() {
        let packer = VariablePacker::new(&structure()).unwrap();
        let rates = decode_rates(&packer, &filled(&packer), Node::Parent).unwrap();
        assert_abs_diff_eq!(rates.value(Rate::Iota, 50.0, 1990.0), 0.02, epsilon = 1e-15);
        assert_abs_diff_eq!(rates.initial_prevalence(2000.0), 0.1, epsilon = 1e-15);
        assert!(!rates.is_modeled(Rate::Omega));
    }

    #[test]
    fn child_rates_apply_the_random_effect() {
        let packer = VariablePacker::new(&structure()).unwrap();
        let vars = filled(&packer);
        let child = decode_rates(&packer, &vars, Node::Child(1)).unwrap();
        assert_abs_diff_eq!(
            child.value(Rate::Iota, 100.0, 2000.0),
            0.03 * 0.5f64.exp(),
            epsilon = 1e-15
        );
        // child 0 has a zero effect
        let child = decode_rates(&packer, &vars, Node::Child(0)).unwrap();
        assert_abs_diff_eq!(child.value(Rate::Iota, 100.0, 2000.0), 0.03, epsilon = 1e-15);
    }

    #[test]
    fn smoothing_without_coordinates_cannot_be_decoded() {
        let mut structure = structure();
        structure.smoothing[0].age = None;
        let packer = VariablePacker::new(&structure).unwrap();
        let vars = PackedVars::zeros(&packer);
        assert_eq!(
            decode_rates(&packer, &vars, Node::Parent).unwrap_err(),
            PackError::MissingCoordinates { smooth_id: 0 }
        );
        assert!(matches!(
            decode_rates(&packer, &vars, Node::Child(2)),
            Err(PackError::IndexOutOfRange { what: "child", .. })
        ));
    }
}
