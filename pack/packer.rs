//! Layout of the flat variable vector.
//!
//! The vector is a dense sequence of blocks in four regions:
//!
//! 1. mulstd: three multipliers per smoothing (value, age difference, time
//!    difference), by smoothing id.
//! 2. rate: for each rate in canonical order, one block per child and then one
//!    for the parent, each sized by that node's smoothing.
//! 3. measurement mulcov: for each integrand, its `meas_value` and
//!    `meas_noise` multipliers in declaration order.
//! 4. rate mulcov: for each rate, its `rate_value` multipliers in declaration
//!    order.
//!
//! Inside a block, the value for age index `i` and time index `j` is at
//! `offset + i * n_time + j`.

use super::structure::{ModelStructure, MulcovKind, MulcovSpec, SmoothingGrid};
use crate::grid::GridFunctionError;
use crate::rates::Rate;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Number of standard deviation multipliers per smoothing.
pub const MULSTD_PER_SMOOTHING: usize = 3;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PackError {
    #[error("{context} refers to smoothing {smooth_id}, but only {n_smooth} smoothings exist")]
    UnknownSmoothing {
        context: String,
        smooth_id: usize,
        n_smooth: usize,
    },
    #[error("multiplier {mulcov_id} refers to integrand {integrand_id}, but only {n_integrand} integrands exist")]
    UnknownIntegrand {
        mulcov_id: usize,
        integrand_id: usize,
        n_integrand: usize,
    },
    #[error("covariate {covariate_id} appears twice as a {kind} multiplier for {target}")]
    DuplicateCovariate {
        kind: MulcovKind,
        target: String,
        covariate_id: usize,
    },
    #[error("rate {0} has more than one smoothing entry")]
    DuplicateRate(Rate),
    #[error("pini smoothing {smooth_id} has {n_age} age points; initial prevalence needs exactly one")]
    PiniAgeGrid { smooth_id: usize, n_age: usize },
    #[error("smoothing {smooth_id} declares {expected} {direction} points but lists {found} coordinates")]
    GridLength {
        smooth_id: usize,
        direction: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{what} index {index} is out of range (length {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },
    #[error("packed vector has length {found}, layout needs {expected}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("block of {n_var} values cannot be viewed as a grid with {n_time} time points")]
    BlockShape { n_var: usize, n_time: usize },
    #[error("smoothing {smooth_id} has no age and time coordinates")]
    MissingCoordinates { smooth_id: usize },
    #[error("smoothing grid: {0}")]
    Grid(#[from] GridFunctionError),
}

/// The node a rate block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Node {
    Child(usize),
    Parent,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Child(j) => write!(f, "child {j}"),
            Node::Parent => f.write_str("parent"),
        }
    }
}

/// Location of one block. `smooth_id` is `None` only for empty blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubvecInfo {
    pub offset: usize,
    pub n_var: usize,
    pub smooth_id: Option<usize>,
}

impl SubvecInfo {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.n_var
    }
}

/// Location and identity of one covariate multiplier block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulcovInfo {
    pub kind: MulcovKind,
    pub covariate_id: usize,
    pub smooth_id: usize,
    pub offset: usize,
    pub n_var: usize,
}

impl MulcovInfo {
    pub fn subvec(&self) -> SubvecInfo {
        SubvecInfo {
            offset: self.offset,
            n_var: self.n_var,
            smooth_id: Some(self.smooth_id),
        }
    }
}

/// What a block holds. `j` is the multiplier's position among those attached
/// to the same integrand or rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKey {
    Mulstd { smooth_id: usize },
    Rate { rate: Rate, node: Node },
    MeasMulcov { integrand_id: usize, j: usize },
    RateMulcov { rate: Rate, j: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub key: BlockKey,
    pub offset: usize,
    pub len: usize,
}

impl Block {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Immutable offset table for the flat variable vector.
///
/// Construction validates the structure and fails on the first problem;
/// afterwards every lookup is a table read.
#[derive(Debug, Clone, PartialEq)]
pub struct VariablePacker {
    n_integrand: usize,
    n_child: usize,
    smoothing: Vec<SmoothingGrid>,
    size: usize,
    blocks: Vec<Block>,
    mulstd_offset: Vec<usize>,
    /// Per rate, `n_child` child blocks followed by the parent block.
    rate_info: [Vec<SubvecInfo>; Rate::COUNT],
    meas_mulcov: Vec<Vec<MulcovInfo>>,
    rate_mulcov: [Vec<MulcovInfo>; Rate::COUNT],
}

struct PendingBlock {
    key: BlockKey,
    smooth_id: Option<usize>,
    len: usize,
}

impl VariablePacker {
    pub fn new(structure: &ModelStructure) -> Result<Self, PackError> {
        validate(structure)?;

        let smoothing = &structure.smoothing;
        let n_var = |smooth_id: Option<usize>| smooth_id.map_or(0, |id| smoothing[id].n_var());

        // Multipliers grouped by what they are attached to, in declaration order.
        let mut meas_members: Vec<Vec<&MulcovSpec>> = vec![Vec::new(); structure.n_integrand];
        let mut rate_members: [Vec<&MulcovSpec>; Rate::COUNT] = Default::default();
        for spec in &structure.mulcov {
            match (spec.integrand_id(), spec.rate()) {
                (Some(integrand_id), _) => meas_members[integrand_id].push(spec),
                (None, Some(rate)) => rate_members[rate.index()].push(spec),
                (None, None) => {}
            }
        }

        // Pass 1: enumerate blocks in packing order.
        let mut pending = Vec::new();
        for smooth_id in 0..smoothing.len() {
            pending.push(PendingBlock {
                key: BlockKey::Mulstd { smooth_id },
                smooth_id: Some(smooth_id),
                len: MULSTD_PER_SMOOTHING,
            });
        }
        for rate in Rate::ALL {
            let entry = structure.rate_smoothing(rate);
            let parent = entry.and_then(|e| e.parent_smooth_id);
            let child = entry.and_then(|e| e.child_smooth_id);
            let nodes = (0..structure.n_child).map(Node::Child).chain(std::iter::once(Node::Parent));
            for node in nodes {
                let smooth_id = match node {
                    Node::Child(_) => child,
                    Node::Parent => parent,
                };
                pending.push(PendingBlock {
                    key: BlockKey::Rate { rate, node },
                    smooth_id,
                    len: n_var(smooth_id),
                });
            }
        }
        for (integrand_id, members) in meas_members.iter().enumerate() {
            for (j, spec) in members.iter().enumerate() {
                pending.push(PendingBlock {
                    key: BlockKey::MeasMulcov { integrand_id, j },
                    smooth_id: Some(spec.smooth_id()),
                    len: n_var(Some(spec.smooth_id())),
                });
            }
        }
        for rate in Rate::ALL {
            for (j, spec) in rate_members[rate.index()].iter().enumerate() {
                pending.push(PendingBlock {
                    key: BlockKey::RateMulcov { rate, j },
                    smooth_id: Some(spec.smooth_id()),
                    len: n_var(Some(spec.smooth_id())),
                });
            }
        }

        // Pass 2: prefix sum of the sizes gives every offset.
        let mut size = 0;
        let mut blocks = Vec::with_capacity(pending.len());
        let mut mulstd_offset = Vec::with_capacity(smoothing.len());
        let mut rate_info: [Vec<SubvecInfo>; Rate::COUNT] = Default::default();
        let mut meas_mulcov: Vec<Vec<MulcovInfo>> = vec![Vec::new(); structure.n_integrand];
        let mut rate_mulcov: [Vec<MulcovInfo>; Rate::COUNT] = Default::default();
        for block in pending {
            let offset = size;
            size += block.len;
            let mulcov_info = |spec: &MulcovSpec| MulcovInfo {
                kind: spec.kind(),
                covariate_id: spec.covariate_id(),
                smooth_id: spec.smooth_id(),
                offset,
                n_var: block.len,
            };
            match block.key {
                BlockKey::Mulstd { .. } => mulstd_offset.push(offset),
                BlockKey::Rate { rate, .. } => rate_info[rate.index()].push(SubvecInfo {
                    offset,
                    n_var: block.len,
                    smooth_id: block.smooth_id,
                }),
                BlockKey::MeasMulcov { integrand_id, j } => {
                    meas_mulcov[integrand_id].push(mulcov_info(meas_members[integrand_id][j]))
                }
                BlockKey::RateMulcov { rate, j } => {
                    rate_mulcov[rate.index()].push(mulcov_info(rate_members[rate.index()][j]))
                }
            }
            blocks.push(Block {
                key: block.key,
                offset,
                len: block.len,
            });
        }

        log::debug!(
            "variable layout: {} blocks, {} variables ({} smoothings, {} children, {} multipliers)",
            blocks.len(),
            size,
            smoothing.len(),
            structure.n_child,
            structure.mulcov.len()
        );

        Ok(Self {
            n_integrand: structure.n_integrand,
            n_child: structure.n_child,
            smoothing: smoothing.clone(),
            size,
            blocks,
            mulstd_offset,
            rate_info,
            meas_mulcov,
            rate_mulcov,
        })
    }

    /// Length of the flat vector.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn integrand_size(&self) -> usize {
        self.n_integrand
    }

    pub fn child_size(&self) -> usize {
        self.n_child
    }

    pub fn smooth_size(&self) -> usize {
        self.smoothing.len()
    }

    pub fn smoothing(&self, smooth_id: usize) -> Result<&SmoothingGrid, PackError> {
        self.smoothing.get(smooth_id).ok_or(PackError::IndexOutOfRange {
            what: "smoothing",
            index: smooth_id,
            len: self.smoothing.len(),
        })
    }

    /// Every block in packing order; consecutive blocks are contiguous.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Maps a numeric child index to a node: `0..n_child` are children and
    /// `n_child` is the parent.
    pub fn node(&self, child_id: usize) -> Result<Node, PackError> {
        match child_id.cmp(&self.n_child) {
            std::cmp::Ordering::Less => Ok(Node::Child(child_id)),
            std::cmp::Ordering::Equal => Ok(Node::Parent),
            std::cmp::Ordering::Greater => Err(PackError::IndexOutOfRange {
                what: "child",
                index: child_id,
                len: self.n_child + 1,
            }),
        }
    }

    /// Offset of the first of the three mulstd values of a smoothing.
    pub fn mulstd_offset(&self, smooth_id: usize) -> Result<usize, PackError> {
        self.mulstd_offset
            .get(smooth_id)
            .copied()
            .ok_or(PackError::IndexOutOfRange {
                what: "smoothing",
                index: smooth_id,
                len: self.mulstd_offset.len(),
            })
    }

    pub fn rate_info(&self, rate: Rate, node: Node) -> Result<SubvecInfo, PackError> {
        let index = match node {
            Node::Parent => self.n_child,
            Node::Child(j) if j < self.n_child => j,
            Node::Child(j) => {
                return Err(PackError::IndexOutOfRange {
                    what: "child",
                    index: j,
                    len: self.n_child,
                });
            }
        };
        Ok(self.rate_info[rate.index()][index])
    }

    /// Number of `meas_value` and `meas_noise` multipliers on an integrand.
    pub fn meas_mulcov_n_cov(&self, integrand_id: usize) -> Result<usize, PackError> {
        Ok(self.meas_members(integrand_id)?.len())
    }

    pub fn meas_mulcov_info(&self, integrand_id: usize, j: usize) -> Result<MulcovInfo, PackError> {
        let members = self.meas_members(integrand_id)?;
        members.get(j).copied().ok_or(PackError::IndexOutOfRange {
            what: "measurement multiplier",
            index: j,
            len: members.len(),
        })
    }

    pub fn meas_value_mulcov_n_cov(&self, integrand_id: usize) -> Result<usize, PackError> {
        self.meas_kind_n_cov(integrand_id, MulcovKind::MeasValue)
    }

    /// The `j`-th `meas_value` multiplier of an integrand.
    pub fn meas_value_mulcov_info(&self, integrand_id: usize, j: usize) -> Result<MulcovInfo, PackError> {
        self.meas_kind_info(integrand_id, MulcovKind::MeasValue, j)
    }

    pub fn meas_noise_mulcov_n_cov(&self, integrand_id: usize) -> Result<usize, PackError> {
        self.meas_kind_n_cov(integrand_id, MulcovKind::MeasNoise)
    }

    /// The `j`-th `meas_noise` multiplier of an integrand.
    pub fn meas_noise_mulcov_info(&self, integrand_id: usize, j: usize) -> Result<MulcovInfo, PackError> {
        self.meas_kind_info(integrand_id, MulcovKind::MeasNoise, j)
    }

    pub fn rate_mulcov_n_cov(&self, rate: Rate) -> usize {
        self.rate_mulcov[rate.index()].len()
    }

    pub fn rate_mulcov_info(&self, rate: Rate, j: usize) -> Result<MulcovInfo, PackError> {
        let members = &self.rate_mulcov[rate.index()];
        members.get(j).copied().ok_or(PackError::IndexOutOfRange {
            what: "rate multiplier",
            index: j,
            len: members.len(),
        })
    }

    fn meas_members(&self, integrand_id: usize) -> Result<&[MulcovInfo], PackError> {
        self.meas_mulcov
            .get(integrand_id)
            .map(Vec::as_slice)
            .ok_or(PackError::IndexOutOfRange {
                what: "integrand",
                index: integrand_id,
                len: self.n_integrand,
            })
    }

    fn meas_kind_n_cov(&self, integrand_id: usize, kind: MulcovKind) -> Result<usize, PackError> {
        let members = self.meas_members(integrand_id)?;
        Ok(members.iter().filter(|info| info.kind == kind).count())
    }

    fn meas_kind_info(
        &self,
        integrand_id: usize,
        kind: MulcovKind,
        j: usize,
    ) -> Result<MulcovInfo, PackError> {
        let members = self.meas_members(integrand_id)?;
        let mut of_kind = members.iter().filter(|info| info.kind == kind);
        match of_kind.nth(j) {
            Some(info) => Ok(*info),
            None => Err(PackError::IndexOutOfRange {
                what: "measurement multiplier",
                index: j,
                len: members.iter().filter(|info| info.kind == kind).count(),
            }),
        }
    }
}

fn validate(structure: &ModelStructure) -> Result<(), PackError> {
    let n_smooth = structure.smoothing.len();
    let check_smooth = |smooth_id: usize, context: &dyn Fn() -> String| {
        if smooth_id < n_smooth {
            Ok(())
        } else {
            Err(PackError::UnknownSmoothing {
                context: context(),
                smooth_id,
                n_smooth,
            })
        }
    };

    for (smooth_id, grid) in structure.smoothing.iter().enumerate() {
        let axes = [("age", grid.n_age, &grid.age), ("time", grid.n_time, &grid.time)];
        for (direction, expected, points) in axes {
            if let Some(points) = points
                && points.len() != expected
            {
                return Err(PackError::GridLength {
                    smooth_id,
                    direction,
                    expected,
                    found: points.len(),
                });
            }
        }
    }

    let mut seen_rates = HashSet::new();
    for entry in &structure.rate {
        if !seen_rates.insert(entry.rate) {
            return Err(PackError::DuplicateRate(entry.rate));
        }
        let used = [("parent", entry.parent_smooth_id), ("child", entry.child_smooth_id)];
        for (role, smooth_id) in used {
            let Some(smooth_id) = smooth_id else { continue };
            check_smooth(smooth_id, &|| format!("{role} smoothing of rate {}", entry.rate))?;
            let n_age = structure.smoothing[smooth_id].n_age;
            if entry.rate == Rate::Pini && n_age != 1 {
                return Err(PackError::PiniAgeGrid { smooth_id, n_age });
            }
        }
    }

    let mut seen_covariates = HashSet::new();
    for (mulcov_id, spec) in structure.mulcov.iter().enumerate() {
        check_smooth(spec.smooth_id(), &|| format!("multiplier {mulcov_id}"))?;
        let target = match (spec.integrand_id(), spec.rate()) {
            (Some(integrand_id), _) => {
                if integrand_id >= structure.n_integrand {
                    return Err(PackError::UnknownIntegrand {
                        mulcov_id,
                        integrand_id,
                        n_integrand: structure.n_integrand,
                    });
                }
                format!("integrand {integrand_id}")
            }
            (None, Some(rate)) => format!("rate {rate}"),
            (None, None) => String::new(),
        };
        if !seen_covariates.insert((spec.kind(), target.clone(), spec.covariate_id())) {
            return Err(PackError::DuplicateCovariate {
                kind: spec.kind(),
                target,
                covariate_id: spec.covariate_id(),
            });
        }
    }
    Ok(())
}
