use thiserror::Error;

use crate::core::lattice::LatticeError;
use crate::core::models::batch::BatchError;
use crate::core::symmetry::SymmetryError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("Batch validation failed: {source}")]
    Batch {
        #[from]
        source: BatchError,
    },

    #[error("Symmetry lookup failed: {source}")]
    Symmetry {
        #[from]
        source: SymmetryError,
    },

    #[error("Lattice conversion failed: {source}")]
    Lattice {
        #[from]
        source: LatticeError,
    },

    #[error("Denoising network failed: {0}")]
    Network(String),

    #[error("Internal logic error: {0}")]
    Internal(String),
}
