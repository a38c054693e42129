use super::packer::{BlockKey, MULSTD_PER_SMOOTHING, Node, PackError, VariablePacker};
use super::structure::MulcovKind;
use crate::rates::Rate;
use std::fmt;

/// Which of the three standard deviation multipliers of a smoothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulstdComponent {
    Value,
    AgeDifference,
    TimeDifference,
}

impl MulstdComponent {
    pub const ALL: [MulstdComponent; MULSTD_PER_SMOOTHING] = [
        MulstdComponent::Value,
        MulstdComponent::AgeDifference,
        MulstdComponent::TimeDifference,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MulstdComponent::Value => "value_mulstd",
            MulstdComponent::AgeDifference => "dage_mulstd",
            MulstdComponent::TimeDifference => "dtime_mulstd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableCategory {
    Mulstd(MulstdComponent),
    Rate { rate: Rate, node: Node },
    MeasMulcov {
        kind: MulcovKind,
        integrand_id: usize,
        covariate_id: usize,
    },
    RateMulcov { rate: Rate, covariate_id: usize },
}

/// Everything known about one position of the flat vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableLabel {
    pub index: usize,
    pub category: VariableCategory,
    pub smooth_id: usize,
    pub smooth_name: String,
    /// `(age index, time index)` inside the smoothing grid; `None` for mulstd.
    pub grid_point: Option<(usize, usize)>,
    /// Age and time of the grid point, when the smoothing has coordinates.
    pub coordinates: Option<(f64, f64)>,
}

impl VariableLabel {
    fn write_point(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.coordinates, self.grid_point) {
            (Some((age, time)), _) => write!(f, "{age}; {time}"),
            (None, Some((i, j))) => write!(f, "a{i}; t{j}"),
            (None, None) => Ok(()),
        }
    }
}

impl fmt::Display for VariableLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category {
            VariableCategory::Mulstd(component) => {
                return write!(f, "{}({})", component.name(), self.smooth_name);
            }
            VariableCategory::Rate { rate, node } => write!(f, "{rate}({node}; ")?,
            VariableCategory::MeasMulcov {
                kind,
                integrand_id,
                covariate_id,
            } => write!(f, "{kind}(integrand {integrand_id}; x{covariate_id}; ")?,
            VariableCategory::RateMulcov { rate, covariate_id } => {
                write!(f, "rate_value({rate}; x{covariate_id}; ")?
            }
        }
        self.write_point(f)?;
        f.write_str(")")
    }
}

impl VariablePacker {
    /// Maps a flat index back to what it addresses.
    pub fn variable_label(&self, index: usize) -> Result<VariableLabel, PackError> {
        if index >= self.size() {
            return Err(PackError::IndexOutOfRange {
                what: "variable",
                index,
                len: self.size(),
            });
        }
        // first block ending after `index`; empty blocks end at their offset
        let blocks = self.blocks();
        let position = blocks.partition_point(|block| block.offset + block.len <= index);
        let block = blocks[position];
        let within = index - block.offset;

        let (category, smooth_id) = match block.key {
            BlockKey::Mulstd { smooth_id } => (
                VariableCategory::Mulstd(MulstdComponent::ALL[within]),
                smooth_id,
            ),
            BlockKey::Rate { rate, node } => {
                let info = self.rate_info(rate, node)?;
                let smooth_id = info.smooth_id.ok_or(PackError::IndexOutOfRange {
                    what: "variable",
                    index,
                    len: self.size(),
                })?;
                (VariableCategory::Rate { rate, node }, smooth_id)
            }
            BlockKey::MeasMulcov { integrand_id, j } => {
                let info = self.meas_mulcov_info(integrand_id, j)?;
                let category = VariableCategory::MeasMulcov {
                    kind: info.kind,
                    integrand_id,
                    covariate_id: info.covariate_id,
                };
                (category, info.smooth_id)
            }
            BlockKey::RateMulcov { rate, j } => {
                let info = self.rate_mulcov_info(rate, j)?;
                let category = VariableCategory::RateMulcov {
                    rate,
                    covariate_id: info.covariate_id,
                };
                (category, info.smooth_id)
            }
        };

        let grid = self.smoothing(smooth_id)?;
        let grid_point = match category {
            VariableCategory::Mulstd(_) => None,
            _ => Some((within / grid.n_time, within % grid.n_time)),
        };
        let coordinates = grid_point.and_then(|(i, j)| {
            grid.coordinates()
                .map(|(age, time)| (age[i], time[j]))
        });

        Ok(VariableLabel {
            index,
            category,
            smooth_id,
            smooth_name: grid.name.clone(),
            grid_point,
            coordinates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::{ModelStructure, MulcovSpec, RateSmoothing, SmoothingGrid};

    fn packer() -> VariablePacker {
        VariablePacker::new(&ModelStructure {
            n_integrand: 1,
            n_child: 1,
            smoothing: vec![
                SmoothingGrid::with_coordinates("smooth_chi", vec![0.0, 50.0], vec![1990.0, 2010.0]),
                SmoothingGrid::new("smooth_cov", 1, 1),
            ],
            mulcov: vec![MulcovSpec::MeasValue {
                integrand_id: 0,
                covariate_id: 3,
                smooth_id: 1,
            }],
            rate: vec![RateSmoothing {
                rate: Rate::Chi,
                parent_smooth_id: Some(0),
                child_smooth_id: Some(1),
            }],
        })
        .unwrap()
    }

    #[test]
    fn labels_name_every_region() {
        let packer = packer();
        let names: Vec<String> = (0..packer.size())
            .map(|index| packer.variable_label(index).unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "value_mulstd(smooth_chi)",
                "dage_mulstd(smooth_chi)",
                "dtime_mulstd(smooth_chi)",
                "value_mulstd(smooth_cov)",
                "dage_mulstd(smooth_cov)",
                "dtime_mulstd(smooth_cov)",
                "chi(child 0; a0; t0)",
                "chi(parent; 0; 1990)",
                "chi(parent; 0; 2010)",
                "chi(parent; 50; 1990)",
                "chi(parent; 50; 2010)",
                "meas_value(integrand 0; x3; a0; t0)",
            ]
        );
    }

    #[test]
    fn label_grid_point_matches_time_major_layout() {
        let packer = packer();
        let parent = packer.rate_info(Rate::Chi, Node::Parent).unwrap();
        let label = packer.variable_label(parent.offset + 2).unwrap();
        assert_eq!(label.grid_point, Some((1, 0)));
        assert_eq!(label.coordinates, Some((50.0, 1990.0)));
        assert_eq!(label.smooth_id, 0);
    }

    #[test]
    fn label_past_the_end_is_an_error() {
        let packer = packer();
        assert_eq!(
            packer.variable_label(packer.size()),
            Err(PackError::IndexOutOfRange {
                what: "variable",
                index: 12,
                len: 12
            })
        );
    }
}
