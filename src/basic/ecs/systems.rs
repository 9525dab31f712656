use std::collections::{BTreeSet, HashMap};

use bevy_ecs::prelude::*;
use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;
use tracing::debug;

use crate::basic::solver::DefaultSolver;

use super::cache::SymmetryMode;
use super::elements::*;
use super::topology::{EliminationOrderRes, Topology};

/// Numeric strategy for the power flow solve.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PfStrategy {
    #[default]
    NewtonRaphson,
    IterativeCurrent,
}

/// Resource that holds the power flow configuration options.
#[derive(Debug, Default, Resource, Clone, serde::Serialize, serde::Deserialize)]
pub struct PowerFlowConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_it: Option<usize>, // Maximum number of iterations
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tol: Option<f64>, // Tolerance for convergence
    pub strategy: PfStrategy,
}

impl PowerFlowConfig {
    pub fn max_iterations(&self) -> usize {
        self.max_it.unwrap_or(100)
    }

    pub fn tolerance(&self) -> f64 {
        self.tol.unwrap_or(1e-8)
    }
}

/// Resource for the results of the latest power flow solve. Voltages are in
/// original node order, one entry per node and phase.
#[derive(Debug, Default, Resource, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PowerFlowResult {
    pub v: DVector<Complex64>,
    pub iterations: usize,
    pub converged: bool,
}

/// Resource wrapping the sparse LU backend instance of this model.
#[derive(Default, Resource)]
pub struct PowerFlowSolver {
    pub solver: DefaultSolver,
}

/// Where one branch lives inside the assembled matrix: the non-zero value
/// offsets to patch when only its admittance changes.
#[derive(Debug, Clone)]
pub struct BranchSlot {
    pub elem: i64,
    /// Value offsets per phase: `[ii, jj, ij, ji]`.
    pub entries: Vec<[usize; 4]>,
    /// Committed per-unit series admittance.
    pub y_pu: Complex64,
    /// `vbase^2 / sbase` conversion into per-unit.
    pub factor: f64,
}

/// The assembled system for one symmetry mode: permuted admittance matrix,
/// injections, initial voltages and the bookkeeping needed for in-place
/// value refreshes.
///
/// Rows are ordered voltage-controlled nodes first, then load nodes, then
/// reference nodes; within each group nodes follow the elimination order, so
/// the factorization works on the fill-minimizing permutation. The
/// generation must match the committed cache status before any solver may
/// consume this state.
#[derive(Debug, Clone)]
pub struct SolverState {
    pub mode: SymmetryMode,
    pub y_bus: CscMatrix<Complex64>,
    pub s_bus: DVector<Complex64>,
    pub v_init: DVector<Complex64>,
    pub npv: usize,
    pub npq: usize,
    /// Original node position -> solver block position.
    pub to_perm: Vec<usize>,
    /// Solver block position -> original node position.
    pub from_perm: Vec<usize>,
    pub branch_slots: Vec<BranchSlot>,
    pub slot_of: HashMap<i64, usize>,
    pub generation: u64,
    /// Result of the last successful solve against exactly this state.
    pub last_result: Option<PowerFlowResult>,
}

impl SolverState {
    /// Maps a solver-ordered voltage vector back to original node order.
    pub fn to_original_order(&self, v: &DVector<Complex64>) -> DVector<Complex64> {
        let ph = self.mode.phases();
        DVector::from_fn(v.len(), |i, _| v[self.to_perm[i / ph] * ph + i % ph])
    }
}

/// Resource holding the per-mode solver states. The two representations are
/// fully independent and may coexist.
#[derive(Default, Resource)]
pub struct SolverStates {
    pub sym: Option<SolverState>,
    pub asym: Option<SolverState>,
}

impl SolverStates {
    pub fn get(&self, mode: SymmetryMode) -> Option<&SolverState> {
        match mode {
            SymmetryMode::Symmetric => self.sym.as_ref(),
            SymmetryMode::Asymmetric => self.asym.as_ref(),
        }
    }

    pub fn get_mut(&mut self, mode: SymmetryMode) -> Option<&mut SolverState> {
        match mode {
            SymmetryMode::Symmetric => self.sym.as_mut(),
            SymmetryMode::Asymmetric => self.asym.as_mut(),
        }
    }

    pub fn set(&mut self, state: SolverState) {
        match state.mode {
            SymmetryMode::Symmetric => self.sym = Some(state),
            SymmetryMode::Asymmetric => self.asym = Some(state),
        }
    }
}

pub(crate) struct BranchData {
    pub elem: i64,
    pub i: usize,
    pub j: usize,
    pub y: Complex64,
    pub y_shunt: Complex64,
    pub y_mutual: Complex64,
    pub factor: f64,
}

pub(crate) struct SourceData {
    pub pos: usize,
    pub vm_pu: f64,
    pub va_deg: f64,
    pub z_ohm: Complex64,
    pub factor: f64,
}

/// Everything the matrix assembly needs, resolved to node positions.
pub(crate) struct GraphSnapshot {
    pub node_count: usize,
    pub sbase: f64,
    pub branches: Vec<BranchData>,
    pub sources: Vec<SourceData>,
    /// (pos, p_mw, vm_pu) of voltage-controlled generators.
    pub gens: Vec<(usize, f64, f64)>,
    /// (pos, p_mw, q_mvar) of loads and uncontrolled generators.
    pub loads: Vec<(usize, f64, f64)>,
    /// (pos, y_pu) of shunts.
    pub shunts: Vec<(usize, Complex64)>,
}

/// Collects the energized component data from the world, resolving node ids
/// to topology positions. Disconnected or unknown references were already
/// dropped during topology extraction and are skipped here the same way.
pub(crate) fn collect_graph(world: &mut World) -> GraphSnapshot {
    let topo = world.resource::<Topology>().clone();
    let sbase = world.resource::<CommonData>().sbase;

    let mut branches = Vec::new();
    {
        let mut q = world.query_filtered::<(
            &ElemID,
            &Port2,
            &Admittance,
            Option<&ShuntAdmittance>,
            Option<&PhaseCoupling>,
            &VBase,
            &EnergizedStatus,
        ), With<Branch>>();
        for (elem, port, y, ysh, ym, vbase, status) in q.iter(world) {
            if !status.0 {
                continue;
            }
            let (Some(i), Some(j)) = (topo.position(port.0[0]), topo.position(port.0[1])) else {
                continue;
            };
            branches.push(BranchData {
                elem: elem.0,
                i,
                j,
                y: y.0,
                y_shunt: ysh.map_or(Complex64::default(), |v| v.0),
                y_mutual: ym.map_or(Complex64::default(), |v| v.0),
                factor: vbase.0 * vbase.0 / sbase,
            });
        }
    }
    branches.sort_by_key(|b| b.elem);

    let bus_vn: HashMap<i64, f64> = {
        let mut q = world.query::<(&BusID, &VNominal)>();
        q.iter(world).map(|(b, vn)| (b.0, vn.0)).collect()
    };

    let mut sources = Vec::new();
    {
        let mut q = world.query_filtered::<(
            &TargetBus,
            &SourceImpedance,
            &TargetVmPu,
            &TargetVaDeg,
            &EnergizedStatus,
        ), With<Source>>();
        for (bus, z, vm, va, status) in q.iter(world) {
            if !status.0 {
                continue;
            }
            let Some(pos) = topo.position(bus.0) else {
                continue;
            };
            // Source impedance converts at the rated voltage of its node.
            let vbase = bus_vn.get(&bus.0).copied().unwrap_or(1.0);
            sources.push(SourceData {
                pos,
                vm_pu: vm.0,
                va_deg: va.0,
                z_ohm: z.0,
                factor: vbase * vbase / sbase,
            });
        }
    }
    sources.sort_by_key(|s| s.pos);

    let mut gens = Vec::new();
    {
        let mut q = world
            .query_filtered::<(&TargetBus, &TargetPMW, &TargetVmPu, &EnergizedStatus), With<Gen>>();
        for (bus, p, vm, status) in q.iter(world) {
            if !status.0 {
                continue;
            }
            if let Some(pos) = topo.position(bus.0) {
                gens.push((pos, p.0, vm.0));
            }
        }
    }
    gens.sort_by_key(|g| g.0);

    let mut loads = Vec::new();
    {
        let mut q = world
            .query_filtered::<(&TargetBus, &TargetPMW, &TargetQMVar, &EnergizedStatus), With<Load>>();
        for (bus, p, q_mvar, status) in q.iter(world) {
            if !status.0 {
                continue;
            }
            if let Some(pos) = topo.position(bus.0) {
                loads.push((pos, p.0, q_mvar.0));
            }
        }
    }
    loads.sort_by_key(|l| l.0);

    let mut shunts = Vec::new();
    {
        let mut q = world.query_filtered::<(&TargetBus, &Admittance, &VBase, &EnergizedStatus), With<EShunt>>();
        for (bus, y, vbase, status) in q.iter(world) {
            if !status.0 {
                continue;
            }
            if let Some(pos) = topo.position(bus.0) {
                shunts.push((pos, y.0 * (vbase.0 * vbase.0 / sbase)));
            }
        }
    }
    shunts.sort_by_key(|s| s.0);

    GraphSnapshot {
        node_count: topo.node_count,
        sbase,
        branches,
        sources,
        gens,
        loads,
        shunts,
    }
}

/// Phase shift of phase `k` in the three-phase representation, radians.
fn phase_shift(k: usize) -> f64 {
    -(k as f64) * 2.0 * std::f64::consts::PI / 3.0
}

/// Builds the full [`SolverState`] for one symmetry mode from scratch:
/// node classification, fill-minimizing permutation, matrix assembly and
/// refresh bookkeeping.
pub fn build_solver_state(world: &mut World, mode: SymmetryMode, generation: u64) -> SolverState {
    let snapshot = collect_graph(world);
    let order = world.resource::<EliminationOrderRes>().0.clone();
    let n = snapshot.node_count;
    let ph = mode.phases();

    // Classify nodes: reference nodes host a source, voltage-controlled
    // nodes host a generator with a magnitude target, the rest are loads.
    let ext_set: BTreeSet<usize> = snapshot.sources.iter().map(|s| s.pos).collect();
    let pv_set: BTreeSet<usize> = snapshot
        .gens
        .iter()
        .map(|g| g.0)
        .filter(|p| !ext_set.contains(p))
        .collect();

    let ranks = order.ranks();
    let by_rank = |nodes: Vec<usize>| -> Vec<usize> {
        let mut v = nodes;
        v.sort_by_key(|&p| (ranks[p], p));
        v
    };
    let pv_nodes = by_rank(pv_set.iter().copied().collect());
    let pq_nodes = by_rank(
        (0..n)
            .filter(|p| !pv_set.contains(p) && !ext_set.contains(p))
            .collect(),
    );
    let ext_nodes = by_rank(ext_set.iter().copied().collect());

    let mut to_perm = vec![0usize; n];
    let mut from_perm = vec![0usize; n];
    for (k, &p) in pv_nodes
        .iter()
        .chain(pq_nodes.iter())
        .chain(ext_nodes.iter())
        .enumerate()
    {
        to_perm[p] = k;
        from_perm[k] = p;
    }

    let npv = pv_nodes.len() * ph;
    let npq = pq_nodes.len() * ph;
    let n_s = n * ph;

    let (s_bus, v_init) = assemble_injections(&snapshot, &to_perm, mode);

    // Matrix assembly in permuted scalar coordinates, so the value layout
    // stays put across parameter refreshes.
    let structural = snapshot.branches.len() * ph * 4
        + if ph == 3 { snapshot.branches.len() * 24 } else { 0 }
        + snapshot.shunts.len() * ph;
    let mut coo = CooMatrix::new(n_s, n_s);
    coo.reserve(structural);

    for b in &snapshot.branches {
        let (i, j) = (to_perm[b.i] * ph, to_perm[b.j] * ph);
        let ys = b.y * b.factor;
        let ysh = b.y_shunt * b.factor;
        let ym = b.y_mutual * b.factor;
        for k in 0..ph {
            coo.push(i + k, i + k, ys + ysh * 0.5);
            coo.push(j + k, j + k, ys + ysh * 0.5);
            coo.push(i + k, j + k, -ys);
            coo.push(j + k, i + k, -ys);
        }
        if ph == 3 {
            for k in 0..3 {
                for l in 0..3 {
                    if k != l {
                        coo.push(i + k, i + l, ym);
                        coo.push(j + k, j + l, ym);
                        coo.push(i + k, j + l, -ym);
                        coo.push(j + k, i + l, -ym);
                    }
                }
            }
        }
    }
    for &(pos, y_pu) in &snapshot.shunts {
        let d = to_perm[pos] * ph;
        for k in 0..ph {
            coo.push(d + k, d + k, y_pu);
        }
    }

    let y_bus = CscMatrix::from(&coo);

    let mut branch_slots = Vec::with_capacity(snapshot.branches.len());
    let mut slot_of = HashMap::with_capacity(snapshot.branches.len());
    for b in &snapshot.branches {
        let (i, j) = (to_perm[b.i] * ph, to_perm[b.j] * ph);
        let entries = (0..ph)
            .map(|k| {
                [
                    entry_offset(&y_bus, i + k, i + k),
                    entry_offset(&y_bus, j + k, j + k),
                    entry_offset(&y_bus, i + k, j + k),
                    entry_offset(&y_bus, j + k, i + k),
                ]
            })
            .collect();
        slot_of.insert(b.elem, branch_slots.len());
        branch_slots.push(BranchSlot {
            elem: b.elem,
            entries,
            y_pu: b.y * b.factor,
            factor: b.factor,
        });
    }

    debug!(
        nodes = n,
        nnz = y_bus.nnz(),
        factor_hint = order.factor_nnz_hint(y_bus.nnz()),
        ?mode,
        generation,
        "system matrix assembled"
    );

    SolverState {
        mode,
        y_bus,
        s_bus,
        v_init,
        npv,
        npq,
        to_perm,
        from_perm,
        branch_slots,
        slot_of,
        generation,
        last_result: None,
    }
}

/// Refreshes numeric values of an existing state in place: injections are
/// reassembled, and only the matrix entries of changed branches are patched.
/// The sparsity pattern and permutation survive untouched.
pub fn refresh_solver_state(
    world: &mut World,
    state: &mut SolverState,
    changed: &BTreeSet<i64>,
    generation: u64,
) {
    let snapshot = collect_graph(world);
    let (s_bus, v_init) = assemble_injections(&snapshot, &state.to_perm, state.mode);
    state.s_bus = s_bus;
    state.v_init = v_init;

    let mut patched = 0usize;
    for b in &snapshot.branches {
        if !changed.contains(&b.elem) {
            continue;
        }
        let Some(&slot_idx) = state.slot_of.get(&b.elem) else {
            continue;
        };
        let slot = &mut state.branch_slots[slot_idx];
        let y_new = b.y * slot.factor;
        let delta = y_new - slot.y_pu;
        if delta != Complex64::default() {
            let values = state.y_bus.values_mut();
            for phase in &slot.entries {
                let [ii, jj, ij, ji] = *phase;
                values[ii] += delta;
                values[jj] += delta;
                values[ij] -= delta;
                values[ji] -= delta;
            }
            slot.y_pu = y_new;
            patched += 1;
        }
    }

    state.generation = generation;
    state.last_result = None;
    debug!(patched, generation, "matrix values refreshed in place");
}

/// Assembles injections and the initial voltage vector in solver ordering.
fn assemble_injections(
    snapshot: &GraphSnapshot,
    to_perm: &[usize],
    mode: SymmetryMode,
) -> (DVector<Complex64>, DVector<Complex64>) {
    let ph = mode.phases();
    let n_s = snapshot.node_count * ph;

    let mut s_bus = DVector::zeros(n_s);
    let mut v_init = DVector::from_fn(n_s, |idx, _| Complex64::from_polar(1.0, phase_shift(idx % ph)));

    // Per-phase per-unit base: every phase row carries the same per-unit
    // injection as the single-phase-equivalent representation.
    for &(pos, p, q) in &snapshot.loads {
        let s = -Complex64::new(p, q) / snapshot.sbase;
        for k in 0..ph {
            s_bus[to_perm[pos] * ph + k] += s;
        }
    }
    for &(pos, p, vm) in &snapshot.gens {
        let s = Complex64::new(p / snapshot.sbase, 0.0);
        for k in 0..ph {
            let row = to_perm[pos] * ph + k;
            s_bus[row] += s;
            v_init[row] = Complex64::from_polar(vm, phase_shift(k));
        }
    }
    for src in &snapshot.sources {
        for k in 0..ph {
            let row = to_perm[src.pos] * ph + k;
            v_init[row] =
                Complex64::from_polar(src.vm_pu, src.va_deg.to_radians() + phase_shift(k));
        }
    }

    (s_bus, v_init)
}

/// Offset of a structurally present entry in the CSC value array.
fn entry_offset(csc: &CscMatrix<Complex64>, row: usize, col: usize) -> usize {
    let lo = csc.col_offsets()[col];
    let hi = csc.col_offsets()[col + 1];
    lo + csc.row_indices()[lo..hi]
        .binary_search(&row)
        .expect("branch entry is structurally present")
}
