//! # symmgen Core Library
//!
//! A library for space-group-conditioned denoising diffusion generation of
//! crystal structures: atomic fractional coordinates, atom types, lattice
//! parameters, and Wyckoff site-symmetry labels are generated jointly, then
//! projected onto the nearest symmetry-consistent Wyckoff orbit.
//!
//! ## Architectural Philosophy
//!
//! The library is designed with a strict three-layer architecture to ensure a
//! clear separation of concerns, making it modular, testable, and extensible.
//!
//! - **[`core`]: The Foundation.** Contains stateless data models
//!   (`CrystalBatch`, `SiteSymmetry`, `Trajectory`), the symmetry-operation
//!   and Wyckoff-position vocabulary with its read-only per-space-group
//!   registry, and pure lattice-representation conversions.
//!
//! - **[`engine`]: The Logic Core.** This stateful layer orchestrates the
//!   multi-channel diffusion process. It includes the discrete and continuous
//!   noise schedules, the wrapped-normal score kernel, the opaque denoising
//!   network interface, forward noising with loss computation, the reverse
//!   predictor-corrector sampler, and the Wyckoff projection task.
//!
//! - **[`workflows`]: The Public API.** This is the highest-level, user-facing
//!   layer. It ties the `engine` and `core` together to execute complete
//!   procedures: structure generation (sampling, dummy-atom removal, orbit
//!   symmetrization, and consistency checks) and the training step with its
//!   divergence recovery path.

pub mod core;
pub mod engine;
pub mod workflows;
