pub mod decode;
pub mod label;
pub mod packer;
pub mod structure;
pub mod vars;

pub use packer::{Block, BlockKey, MulcovInfo, Node, PackError, SubvecInfo, VariablePacker};
pub use structure::{ModelStructure, MulcovKind, MulcovSpec, RateSmoothing, SmoothingGrid};
pub use vars::PackedVars;
