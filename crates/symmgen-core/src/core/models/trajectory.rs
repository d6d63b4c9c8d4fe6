use nalgebra::{DVector, Matrix3, Vector3, Vector6};

use super::batch::DUMMY_ATOM_TYPE;

/// One full state snapshot of the reverse diffusion process at a single
/// timestep: noised coordinates plus the continuous logits of every other
/// channel.
#[derive(Debug, Clone)]
pub struct TrajectoryStep {
    pub frac_coords: Vec<Vector3<f64>>,
    /// Per-atom atom-type logits (94 classes).
    pub atom_types: Vec<DVector<f64>>,
    /// Per-atom flattened site-symmetry logits (195 dims).
    pub site_symm: Vec<DVector<f64>>,
    pub lattices: Vec<Matrix3<f64>>,
    pub ks: Vec<Vector6<f64>>,
}

/// Append-only log of the reverse sampling trajectory.
///
/// Snapshots are stored at index `T - t`, so entry 0 is the initial noise at
/// `t = T` and the last entry of a complete run is the denoised state at
/// `t = 0`. The strictly sequential dependency between steps makes any other
/// access pattern invalid, so no keyed lookup is offered.
#[derive(Debug, Clone)]
pub struct Trajectory {
    timesteps: usize,
    num_atoms: Vec<usize>,
    spacegroup: Vec<u16>,
    steps: Vec<TrajectoryStep>,
}

/// Stacked all-timestep views of a completed trajectory, ordered from
/// `t = T` down to `t = 0`.
#[derive(Debug, Clone)]
pub struct TrajectoryStack {
    pub num_atoms: Vec<usize>,
    /// Decoded atom-type labels per timestep (argmax + 1).
    pub atom_types: Vec<Vec<u8>>,
    pub site_symm: Vec<Vec<DVector<f64>>>,
    pub all_frac_coords: Vec<Vec<Vector3<f64>>>,
    pub all_lattices: Vec<Vec<Matrix3<f64>>>,
    pub all_ks: Vec<Vec<Vector6<f64>>>,
    pub all_spacegroup: Vec<Vec<u16>>,
}

impl Trajectory {
    pub fn new(timesteps: usize, num_atoms: Vec<usize>, spacegroup: Vec<u16>) -> Self {
        Self {
            timesteps,
            num_atoms,
            spacegroup,
            steps: Vec::with_capacity(timesteps + 1),
        }
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn num_atoms(&self) -> &[usize] {
        &self.num_atoms
    }

    pub fn spacegroup(&self) -> &[u16] {
        &self.spacegroup
    }

    /// Number of snapshots recorded so far; `timesteps + 1` once complete.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.len() == self.timesteps + 1
    }

    /// Appends the snapshot for the next timestep in the T..0 order.
    pub fn push(&mut self, step: TrajectoryStep) {
        debug_assert!(self.steps.len() <= self.timesteps);
        self.steps.push(step);
    }

    /// Most recently recorded snapshot.
    pub fn latest(&self) -> Option<&TrajectoryStep> {
        self.steps.last()
    }

    /// Snapshot at diffusion time `t`, if recorded.
    pub fn step_at_time(&self, t: usize) -> Option<&TrajectoryStep> {
        if t > self.timesteps {
            return None;
        }
        self.steps.get(self.timesteps - t)
    }

    /// Terminal denoised snapshot (`t = 0`) of a complete trajectory.
    pub fn final_step(&self) -> Option<&TrajectoryStep> {
        if self.is_complete() {
            self.steps.last()
        } else {
            None
        }
    }

    /// Collects the stacked per-timestep views used for trajectory analysis.
    pub fn stack(&self) -> TrajectoryStack {
        TrajectoryStack {
            num_atoms: self.num_atoms.clone(),
            atom_types: self
                .steps
                .iter()
                .map(|s| s.atom_types.iter().map(decode_atom_type).collect())
                .collect(),
            site_symm: self.steps.iter().map(|s| s.site_symm.clone()).collect(),
            all_frac_coords: self.steps.iter().map(|s| s.frac_coords.clone()).collect(),
            all_lattices: self.steps.iter().map(|s| s.lattices.clone()).collect(),
            all_ks: self.steps.iter().map(|s| s.ks.clone()).collect(),
            all_spacegroup: self.steps.iter().map(|_| self.spacegroup.clone()).collect(),
        }
    }
}

/// Decodes atom-type logits to an element label in `[1, 94]` (first maximum
/// wins).
pub fn decode_atom_type(logits: &DVector<f64>) -> u8 {
    let mut best = 0;
    for i in 1..logits.len() {
        if logits[i] > logits[best] {
            best = i;
        }
    }
    (best + 1) as u8
}

/// Whether decoded logits select the reserved dummy element.
pub fn is_dummy(logits: &DVector<f64>) -> bool {
    decode_atom_type(logits) == DUMMY_ATOM_TYPE
}
