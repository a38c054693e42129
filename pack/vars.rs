use super::packer::{MULSTD_PER_SMOOTHING, PackError, SubvecInfo, VariablePacker};
use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewMut1, s};
use std::ops::{Deref, DerefMut};

/// Values of the flat variable vector for one optimizer iteration.
///
/// The layout comes from a [`VariablePacker`]; this type only holds numbers.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct PackedVars(pub Array1<f64>);

impl PackedVars {
    pub fn zeros(packer: &VariablePacker) -> Self {
        Self(Array1::zeros(packer.size()))
    }

    /// Wraps a vector returned by the optimizer, checking its length.
    pub fn from_vec(packer: &VariablePacker, values: Vec<f64>) -> Result<Self, PackError> {
        if values.len() != packer.size() {
            return Err(PackError::LengthMismatch {
                expected: packer.size(),
                found: values.len(),
            });
        }
        Ok(Self(Array1::from(values)))
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }

    pub fn block(&self, info: SubvecInfo) -> Result<ArrayView1<'_, f64>, PackError> {
        self.check_block(info)?;
        Ok(self.0.slice(s![info.range()]))
    }

    pub fn block_mut(&mut self, info: SubvecInfo) -> Result<ArrayViewMut1<'_, f64>, PackError> {
        self.check_block(info)?;
        Ok(self.0.slice_mut(s![info.range()]))
    }

    /// A block as an `(n_age, n_time)` array; row `i` holds age index `i`.
    pub fn grid(&self, info: SubvecInfo, n_time: usize) -> Result<ArrayView2<'_, f64>, PackError> {
        let shape_error = PackError::BlockShape {
            n_var: info.n_var,
            n_time,
        };
        if n_time == 0 || info.n_var % n_time != 0 {
            return Err(shape_error);
        }
        let n_age = info.n_var / n_time;
        self.block(info)?
            .into_shape_with_order((n_age, n_time))
            .map_err(|_| shape_error)
    }

    /// The value, age difference and time difference standard deviation
    /// multipliers of a smoothing.
    pub fn mulstd(&self, packer: &VariablePacker, smooth_id: usize) -> Result<[f64; 3], PackError> {
        let block = self.block(mulstd_info(packer, smooth_id)?)?;
        Ok([block[0], block[1], block[2]])
    }

    pub fn set_mulstd(
        &mut self,
        packer: &VariablePacker,
        smooth_id: usize,
        values: [f64; 3],
    ) -> Result<(), PackError> {
        let mut block = self.block_mut(mulstd_info(packer, smooth_id)?)?;
        for (slot, value) in block.iter_mut().zip(values) {
            *slot = value;
        }
        Ok(())
    }

    fn check_block(&self, info: SubvecInfo) -> Result<(), PackError> {
        if info.range().end > self.0.len() {
            return Err(PackError::IndexOutOfRange {
                what: "block end",
                index: info.range().end,
                len: self.0.len(),
            });
        }
        Ok(())
    }
}

fn mulstd_info(packer: &VariablePacker, smooth_id: usize) -> Result<SubvecInfo, PackError> {
    Ok(SubvecInfo {
        offset: packer.mulstd_offset(smooth_id)?,
        n_var: MULSTD_PER_SMOOTHING,
        smooth_id: Some(smooth_id),
    })
}

impl Deref for PackedVars {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PackedVars {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<PackedVars> for Vec<f64> {
    fn from(values: PackedVars) -> Self {
        values.0.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{ModelStructure, Node, RateSmoothing, SmoothingGrid};
    use crate::rates::Rate;

    fn packer() -> VariablePacker {
        VariablePacker::new(&ModelStructure {
            n_integrand: 1,
            n_child: 1,
            smoothing: vec![SmoothingGrid::new("omega", 3, 2)],
            mulcov: Vec::new(),
            rate: vec![RateSmoothing {
                rate: Rate::Omega,
                parent_smooth_id: Some(0),
                child_smooth_id: None,
            }],
        })
        .unwrap()
    }

    #[test]
    fn grid_view_is_time_major_within_age() {
        let packer = packer();
        let info = packer.rate_info(Rate::Omega, Node::Parent).unwrap();
        let mut vars = PackedVars::zeros(&packer);
        for (k, value) in vars.block_mut(info).unwrap().iter_mut().enumerate() {
            *value = k as f64;
        }
        let grid = vars.grid(info, 2).unwrap();
        assert_eq!(grid.dim(), (3, 2));
        // offset + i * n_time + j
        assert_eq!(grid[[2, 1]], 5.0);
        assert_eq!(grid[[1, 0]], 2.0);
        assert_eq!(vars[info.offset + 2 * 2 + 1], 5.0);
        assert!(matches!(vars.grid(info, 4), Err(PackError::BlockShape { .. })));
    }

    #[test]
    fn mulstd_values_round_trip() {
        let packer = packer();
        let mut vars = PackedVars::zeros(&packer);
        vars.set_mulstd(&packer, 0, [1.5, 2.5, 3.5]).unwrap();
        assert_eq!(vars.mulstd(&packer, 0).unwrap(), [1.5, 2.5, 3.5]);
        assert_eq!(vars.slice(s![0..3]).to_vec(), vec![1.5, 2.5, 3.5]);
        assert!(vars.mulstd(&packer, 1).is_err());
    }

    #[test]
    fn optimizer_vectors_are_length_checked() {
        let packer = packer();
        assert_eq!(
            PackedVars::from_vec(&packer, vec![0.0; 4]),
            Err(PackError::LengthMismatch {
                expected: packer.size(),
                found: 4
            })
        );
        let vars = PackedVars::from_vec(&packer, vec![0.25; packer.size()]).unwrap();
        assert_eq!(Vec::from(vars), vec![0.25; 9]);
    }
}
