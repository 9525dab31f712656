use bevy_ecs::prelude::*;
use std::collections::BTreeSet;

/// Single-phase-equivalent or full three-phase representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SymmetryMode {
    Symmetric,
    Asymmetric,
}

impl SymmetryMode {
    /// Scalar rows per electrical node in this representation.
    pub fn phases(&self) -> usize {
        match self {
            SymmetryMode::Symmetric => 1,
            SymmetryMode::Asymmetric => 3,
        }
    }
}

/// Which representation the last successful solve used.
///
/// Kept as an explicit tri-state: "never solved" and "solved in the other
/// mode" require different handling, so a boolean cannot express this.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LastSolvedMode {
    #[default]
    Never,
    Symmetric,
    Asymmetric,
}

/// Validity of one representation's cached matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    BothInvalid,
    TopologyValidOnly,
    FullyValid,
}

/// Cache bookkeeping for one symmetry mode.
#[derive(Debug, Clone, Default)]
pub struct ModeCache {
    pub topology_valid: bool,
    pub params_valid: bool,
    /// Generation stamped into the matrices the last time this mode was
    /// (re)built; solvers refuse state carrying any other generation.
    pub matrix_generation: u64,
    /// Component ids whose parameters changed since this mode was last valid.
    pub changed: BTreeSet<i64>,
}

impl ModeCache {
    pub fn state(&self) -> CacheState {
        match (self.topology_valid, self.params_valid) {
            (true, true) => CacheState::FullyValid,
            (true, false) => CacheState::TopologyValidOnly,
            _ => CacheState::BothInvalid,
        }
    }
}

/// Tracks, per symmetry mode, whether the derived topology and matrix values
/// are still valid relative to the last committed update, and which component
/// ids changed in between.
///
/// Initial state: both modes fully invalid, nothing solved yet.
#[derive(Debug, Clone, Default, Resource)]
pub struct CacheStatus {
    sym: ModeCache,
    asym: ModeCache,
    pub last_solved: LastSolvedMode,
    generation_counter: u64,
}

impl CacheStatus {
    pub fn mode(&self, mode: SymmetryMode) -> &ModeCache {
        match mode {
            SymmetryMode::Symmetric => &self.sym,
            SymmetryMode::Asymmetric => &self.asym,
        }
    }

    fn mode_mut(&mut self, mode: SymmetryMode) -> &mut ModeCache {
        match mode {
            SymmetryMode::Symmetric => &mut self.sym,
            SymmetryMode::Asymmetric => &mut self.asym,
        }
    }

    /// Fresh generation stamp for a rebuilt or refreshed matrix.
    pub fn next_generation(&mut self) -> u64 {
        self.generation_counter += 1;
        self.generation_counter
    }

    /// A committed update changed switching status: both representations lose
    /// their structure, and with it their values.
    pub fn note_topology_change(&mut self) {
        for cache in [&mut self.sym, &mut self.asym] {
            cache.topology_valid = false;
            cache.params_valid = false;
            cache.changed.clear();
        }
    }

    /// A committed update changed only numeric parameters of the given
    /// component ids. Structure survives; values of both representations are
    /// stale wherever a matrix was actually built.
    pub fn note_param_change(&mut self, ids: impl IntoIterator<Item = i64> + Clone) {
        for cache in [&mut self.sym, &mut self.asym] {
            cache.params_valid = false;
            cache.changed.extend(ids.clone());
        }
    }

    /// A matrix structure was (re)built for this mode.
    pub fn note_structure_built(&mut self, mode: SymmetryMode, generation: u64) {
        let cache = self.mode_mut(mode);
        cache.topology_valid = true;
        cache.params_valid = true;
        cache.matrix_generation = generation;
        cache.changed.clear();
    }

    /// Matrix values were refreshed in place for this mode.
    pub fn note_values_refreshed(&mut self, mode: SymmetryMode, generation: u64) {
        let cache = self.mode_mut(mode);
        cache.params_valid = true;
        cache.matrix_generation = generation;
        cache.changed.clear();
    }

    /// A solve completed successfully in this mode.
    pub fn note_solved(&mut self, mode: SymmetryMode) {
        self.last_solved = match mode {
            SymmetryMode::Symmetric => LastSolvedMode::Symmetric,
            SymmetryMode::Asymmetric => LastSolvedMode::Asymmetric,
        };
    }

    pub fn needs_structure(&self, mode: SymmetryMode) -> bool {
        !self.mode(mode).topology_valid
    }

    /// Whether values must be refreshed before solving in this mode. A switch
    /// from the other representation forces at least a value refresh even if
    /// nothing changed, because the matrices are structurally different.
    pub fn needs_values(&self, mode: SymmetryMode) -> bool {
        if !self.mode(mode).params_valid {
            return true;
        }
        match (self.last_solved, mode) {
            (LastSolvedMode::Symmetric, SymmetryMode::Asymmetric) => true,
            (LastSolvedMode::Asymmetric, SymmetryMode::Symmetric) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_invalid() {
        let cache = CacheStatus::default();
        assert_eq!(cache.mode(SymmetryMode::Symmetric).state(), CacheState::BothInvalid);
        assert_eq!(cache.mode(SymmetryMode::Asymmetric).state(), CacheState::BothInvalid);
        assert_eq!(cache.last_solved, LastSolvedMode::Never);
    }

    #[test]
    fn test_build_then_param_change() {
        let mut cache = CacheStatus::default();
        let generation = cache.next_generation();
        cache.note_structure_built(SymmetryMode::Symmetric, generation);
        assert_eq!(cache.mode(SymmetryMode::Symmetric).state(), CacheState::FullyValid);

        cache.note_param_change([7, 9]);
        assert_eq!(
            cache.mode(SymmetryMode::Symmetric).state(),
            CacheState::TopologyValidOnly
        );
        assert!(cache.mode(SymmetryMode::Symmetric).changed.contains(&7));
        // The other representation keeps its (invalid) structure state.
        assert_eq!(cache.mode(SymmetryMode::Asymmetric).state(), CacheState::BothInvalid);
    }

    #[test]
    fn test_topology_change_hits_both_modes() {
        let mut cache = CacheStatus::default();
        let g1 = cache.next_generation();
        cache.note_structure_built(SymmetryMode::Symmetric, g1);
        let g2 = cache.next_generation();
        cache.note_structure_built(SymmetryMode::Asymmetric, g2);

        cache.note_topology_change();
        for mode in [SymmetryMode::Symmetric, SymmetryMode::Asymmetric] {
            assert_eq!(cache.mode(mode).state(), CacheState::BothInvalid);
            assert!(cache.needs_structure(mode));
        }
    }

    #[test]
    fn test_mode_switch_forces_value_refresh() {
        let mut cache = CacheStatus::default();
        let g1 = cache.next_generation();
        cache.note_structure_built(SymmetryMode::Symmetric, g1);
        let g2 = cache.next_generation();
        cache.note_structure_built(SymmetryMode::Asymmetric, g2);

        cache.note_solved(SymmetryMode::Symmetric);
        assert!(!cache.needs_values(SymmetryMode::Symmetric));
        assert!(cache.needs_values(SymmetryMode::Asymmetric));

        cache.note_solved(SymmetryMode::Asymmetric);
        assert!(cache.needs_values(SymmetryMode::Symmetric));
    }

    #[test]
    fn test_generation_monotonic() {
        let mut cache = CacheStatus::default();
        let a = cache.next_generation();
        let b = cache.next_generation();
        assert!(b > a);
    }
}
