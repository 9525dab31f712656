use bevy_ecs::prelude::*;
use nalgebra::Complex;
use num_complex::Complex64;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::basic::error::{SolverError, SolverResult};
use crate::basic::iterative::iterative_current_pf;
use crate::basic::newton_pf;
use crate::basic::solver::DefaultSolver;

use super::cache::SymmetryMode;
use super::elements::*;
use super::network::{DataOps, GridModel};
use super::systems::{PfStrategy, PowerFlowConfig, PowerFlowResult, SolverState, SolverStates};
use super::topology::{Topology, UpdateClass, classify_update};

/// One per-component update: the identifier plus the attributes it touches.
/// `None` fields are unspecified and leave the committed value untouched.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UpdateRecord {
    pub id: i64,
    pub status: Option<bool>,
    pub p_mw: Option<f64>,
    pub q_mvar: Option<f64>,
    pub vm_pu: Option<f64>,
    pub y_series: Option<Complex64>,
}

impl UpdateRecord {
    pub fn new(id: i64) -> Self {
        UpdateRecord {
            id,
            ..Default::default()
        }
    }

    /// Ingests the sentinel encoding of the buffer boundary: NaN numeric
    /// fields and a negative status mean "not specified".
    pub fn from_sentinels(id: i64, status: i8, p_mw: f64, q_mvar: f64, vm_pu: f64) -> Self {
        let opt = |v: f64| (!v.is_nan()).then_some(v);
        UpdateRecord {
            id,
            status: (status >= 0).then_some(status != 0),
            p_mw: opt(p_mw),
            q_mvar: opt(q_mvar),
            vm_pu: opt(vm_pu),
            y_series: None,
        }
    }

    /// Which attributes this record touches, as a structural signature.
    fn shape(&self) -> u8 {
        (self.status.is_some() as u8)
            | (self.p_mw.is_some() as u8) << 1
            | (self.q_mvar.is_some() as u8) << 2
            | (self.vm_pu.is_some() as u8) << 3
            | (self.y_series.is_some() as u8) << 4
    }
}

/// One batch scenario: an ordered list of component updates.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UpdateScenario {
    pub records: Vec<UpdateRecord>,
}

/// A set of batch scenarios differing in small deltas from the base case.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BatchUpdateSet {
    pub scenarios: Vec<UpdateScenario>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchClass {
    /// Scenarios may run on isolated copies of the base state, in parallel.
    Independent,
    /// Scenarios build on one another and must run strictly in order.
    Dependent,
}

/// Decides whether the scenarios of a batch can be solved without
/// interfering with each other.
///
/// Independence holds when every scenario carries the same attribute shape
/// (count and order of touched attributes) and the scenarios either all
/// address the same identifier sequence or address pairwise disjoint
/// identifier sets. Any structural mismatch, duplicate identifier, or partial
/// overlap takes the conservative dependent path: misclassifying dependent
/// data would race.
pub fn classify_batch(set: &BatchUpdateSet) -> BatchClass {
    let mut scenarios = set.scenarios.iter();
    let Some(first) = scenarios.next() else {
        return BatchClass::Independent;
    };

    let signature = |s: &UpdateScenario| -> Vec<(i64, u8)> {
        s.records.iter().map(|r| (r.id, r.shape())).collect()
    };
    let id_set = |s: &UpdateScenario| -> BTreeSet<i64> {
        s.records.iter().map(|r| r.id).collect()
    };

    let first_sig = signature(first);
    let first_ids = id_set(first);
    if first_ids.len() != first.records.len() {
        return BatchClass::Dependent;
    }

    let mut same_ids = true;
    let mut seen_ids = vec![first_ids];
    for scenario in scenarios {
        let sig = signature(scenario);
        if sig.len() != first_sig.len() {
            return BatchClass::Dependent;
        }
        for (a, b) in sig.iter().zip(first_sig.iter()) {
            if a.1 != b.1 {
                return BatchClass::Dependent;
            }
        }
        let ids = id_set(scenario);
        if ids.len() != scenario.records.len() {
            return BatchClass::Dependent;
        }
        if sig.iter().map(|s| s.0).ne(first_sig.iter().map(|s| s.0)) {
            same_ids = false;
        }
        seen_ids.push(ids);
    }

    if same_ids {
        return BatchClass::Independent;
    }
    for i in 0..seen_ids.len() {
        for j in (i + 1)..seen_ids.len() {
            if !seen_ids[i].is_disjoint(&seen_ids[j]) {
                return BatchClass::Dependent;
            }
        }
    }
    BatchClass::Independent
}

/// Applies a scenario's records onto the committed component graph.
pub fn apply_scenario(world: &mut World, scenario: &UpdateScenario) {
    let pairs: Vec<(Entity, UpdateRecord)> = {
        let lookup = world.resource::<ElemLookup>();
        scenario
            .records
            .iter()
            .filter_map(|r| lookup.get(&r.id).map(|&e| (e, r.clone())))
            .collect()
    };
    for (entity, record) in pairs {
        if let Some(status) = record.status {
            if let Some(mut c) = world.get_mut::<EnergizedStatus>(entity) {
                c.0 = status;
            }
        }
        if let Some(p) = record.p_mw {
            if let Some(mut c) = world.get_mut::<TargetPMW>(entity) {
                c.0 = p;
            }
        }
        if let Some(q) = record.q_mvar {
            if let Some(mut c) = world.get_mut::<TargetQMVar>(entity) {
                c.0 = q;
            }
        }
        if let Some(vm) = record.vm_pu {
            if let Some(mut c) = world.get_mut::<TargetVmPu>(entity) {
                c.0 = vm;
            }
        }
        if let Some(y) = record.y_series {
            if let Some(mut c) = world.get_mut::<Admittance>(entity) {
                c.0 = y;
            }
        }
    }
}

/// Where one scenario record lands in the numeric state.
#[derive(Debug, Clone)]
enum UpdateSlot {
    Load {
        row_base: usize,
        p_mw: f64,
        q_mvar: f64,
    },
    Gen {
        row_base: usize,
        p_mw: f64,
    },
    Source {
        row_base: usize,
    },
    BranchY {
        slot: usize,
    },
}

/// Mapping from a scenario's component identifiers to stable positions in
/// the numeric solver state. Built once per independent batch; every
/// scenario of the batch reuses it to apply its deltas to an isolated copy.
#[derive(Debug, Clone)]
pub struct SequenceIndex {
    slots: Vec<UpdateSlot>,
    sbase: f64,
    phases: usize,
}

impl SequenceIndex {
    pub fn build(
        world: &World,
        state: &SolverState,
        scenario: &UpdateScenario,
    ) -> SolverResult<Self> {
        let lookup = world.resource::<ElemLookup>();
        let topo = world.resource::<Topology>();
        let sbase = world.resource::<CommonData>().sbase;
        let ph = state.mode.phases();

        let mut slots = Vec::with_capacity(scenario.records.len());
        for record in &scenario.records {
            let &entity = lookup.get(&record.id).ok_or_else(|| SolverError::Config {
                what: format!("batch update references unknown component {}", record.id),
            })?;

            if world.get::<Branch>(entity).is_some() {
                let &slot = state.slot_of.get(&record.id).ok_or_else(|| {
                    SolverError::Config {
                        what: format!("branch {} is not part of the built matrix", record.id),
                    }
                })?;
                slots.push(UpdateSlot::BranchY { slot });
                continue;
            }

            let bus = world
                .get::<TargetBus>(entity)
                .ok_or_else(|| SolverError::Config {
                    what: format!("component {} has no updatable terminal", record.id),
                })?;
            let pos = topo.position(bus.0).ok_or_else(|| SolverError::Config {
                what: format!("component {} references unknown node {}", record.id, bus.0),
            })?;
            let row_base = state.to_perm[pos] * ph;

            if world.get::<Load>(entity).is_some() {
                slots.push(UpdateSlot::Load {
                    row_base,
                    p_mw: world.get::<TargetPMW>(entity).map_or(0.0, |c| c.0),
                    q_mvar: world.get::<TargetQMVar>(entity).map_or(0.0, |c| c.0),
                });
            } else if world.get::<Gen>(entity).is_some() {
                slots.push(UpdateSlot::Gen {
                    row_base,
                    p_mw: world.get::<TargetPMW>(entity).map_or(0.0, |c| c.0),
                });
            } else if world.get::<Source>(entity).is_some() {
                slots.push(UpdateSlot::Source { row_base });
            } else {
                return Err(SolverError::Config {
                    what: format!("component {} cannot take batch updates", record.id),
                });
            }
        }

        Ok(SequenceIndex {
            slots,
            sbase,
            phases: ph,
        })
    }

    /// Applies one scenario's deltas to an isolated numeric state.
    fn apply(&self, state: &mut SolverState, scenario: &UpdateScenario) {
        let ph = self.phases;
        for (slot, record) in self.slots.iter().zip(scenario.records.iter()) {
            match slot {
                UpdateSlot::Load {
                    row_base,
                    p_mw,
                    q_mvar,
                } => {
                    let p_new = record.p_mw.unwrap_or(*p_mw);
                    let q_new = record.q_mvar.unwrap_or(*q_mvar);
                    let delta = -Complex64::new(p_new - p_mw, q_new - q_mvar) / self.sbase;
                    for k in 0..ph {
                        state.s_bus[row_base + k] += delta;
                    }
                }
                UpdateSlot::Gen { row_base, p_mw } => {
                    let p_new = record.p_mw.unwrap_or(*p_mw);
                    let delta = Complex64::new((p_new - p_mw) / self.sbase, 0.0);
                    for k in 0..ph {
                        state.s_bus[row_base + k] += delta;
                        if let Some(vm) = record.vm_pu {
                            let angle = state.v_init[row_base + k].arg();
                            state.v_init[row_base + k] = Complex::from_polar(vm, angle);
                        }
                    }
                }
                UpdateSlot::Source { row_base } => {
                    if let Some(vm) = record.vm_pu {
                        for k in 0..ph {
                            let angle = state.v_init[row_base + k].arg();
                            state.v_init[row_base + k] = Complex::from_polar(vm, angle);
                        }
                    }
                }
                UpdateSlot::BranchY { slot } => {
                    if let Some(y) = record.y_series {
                        let branch = &mut state.branch_slots[*slot];
                        let y_new = y * branch.factor;
                        let delta = y_new - branch.y_pu;
                        if delta != Complex64::default() {
                            let values = state.y_bus.values_mut();
                            for phase in &branch.entries {
                                let [ii, jj, ij, ji] = *phase;
                                values[ii] += delta;
                                values[jj] += delta;
                                values[ij] -= delta;
                                values[ji] -= delta;
                            }
                            branch.y_pu = y_new;
                        }
                    }
                }
            }
        }
    }
}

/// Solves a power flow for every scenario of the batch.
///
/// Independent scenarios fan out over a worker pool, each against an
/// isolated copy of the base numeric state; the committed component graph,
/// topology and elimination order stay untouched and shared read-only.
/// Dependent scenarios are committed and solved strictly in order, so each
/// sees the cumulative effect of its predecessors. Results are
/// scenario-indexed; an error in one scenario never corrupts its siblings.
pub fn run_power_flow_batch(
    model: &mut GridModel,
    set: &BatchUpdateSet,
    mode: SymmetryMode,
) -> Vec<SolverResult<PowerFlowResult>> {
    if set.scenarios.is_empty() {
        return Vec::new();
    }

    let mut class = classify_batch(set);
    if class == BatchClass::Independent
        && set
            .scenarios
            .iter()
            .any(|s| classify_update(model.world(), s) == UpdateClass::TopologyChanged)
    {
        // Switching changes rewrite shared structure; single-writer only.
        class = BatchClass::Dependent;
    }
    debug!(scenarios = set.scenarios.len(), ?class, "batch classified");

    match class {
        BatchClass::Independent => run_independent(model, set, mode),
        BatchClass::Dependent => set
            .scenarios
            .iter()
            .map(|scenario| {
                model.commit_update(scenario)?;
                model.solve_power_flow(mode)
            })
            .collect(),
    }
}

fn run_independent(
    model: &mut GridModel,
    set: &BatchUpdateSet,
    mode: SymmetryMode,
) -> Vec<SolverResult<PowerFlowResult>> {
    let fail_all = |e: SolverError| -> Vec<SolverResult<PowerFlowResult>> {
        set.scenarios.iter().map(|_| Err(e.clone())).collect()
    };

    if let Err(e) = model.ensure_solver_state(mode) {
        return fail_all(e);
    }
    if !model.world().resource::<Topology>().all_supplied() {
        return fail_all(SolverError::IllPosed {
            what: "island(s) without an energized source".into(),
        });
    }

    let cfg = model.world().resource::<PowerFlowConfig>().clone();
    let base = model
        .world()
        .resource::<SolverStates>()
        .get(mode)
        .unwrap()
        .clone();

    // One index per scenario; identical identifier sequences share the first.
    let first_index = match SequenceIndex::build(model.world(), &base, &set.scenarios[0]) {
        Ok(idx) => idx,
        Err(e) => return fail_all(e),
    };
    let same_ids = set.scenarios.iter().all(|s| {
        s.records
            .iter()
            .map(|r| r.id)
            .eq(set.scenarios[0].records.iter().map(|r| r.id))
    });
    let mut indexes = Vec::with_capacity(set.scenarios.len());
    for scenario in &set.scenarios {
        if same_ids {
            indexes.push(first_index.clone());
        } else {
            match SequenceIndex::build(model.world(), &base, scenario) {
                Ok(idx) => indexes.push(idx),
                Err(e) => return fail_all(e),
            }
        }
    }

    info!(
        scenarios = set.scenarios.len(),
        workers = num_cpus::get(),
        "running independent batch in parallel"
    );

    let solve_one = |(scenario, index): (&UpdateScenario, &SequenceIndex)| {
        let mut local = base.clone();
        index.apply(&mut local, scenario);
        let mut solver = DefaultSolver::default();
        let solved = match cfg.strategy {
            PfStrategy::NewtonRaphson => newton_pf(
                &local.y_bus,
                &local.s_bus,
                &local.v_init,
                local.npv,
                local.npq,
                cfg.tolerance(),
                cfg.max_iterations(),
                &mut solver,
            ),
            PfStrategy::IterativeCurrent => iterative_current_pf(
                &local.y_bus,
                &local.s_bus,
                &local.v_init,
                local.npv,
                local.npq,
                cfg.tolerance(),
                cfg.max_iterations(),
                &mut solver,
            ),
        };
        solved.map(|(v, iterations)| PowerFlowResult {
            v: local.to_original_order(&v),
            iterations,
            converged: true,
        })
    };

    match ThreadPoolBuilder::new().num_threads(num_cpus::get()).build() {
        Ok(pool) => pool.install(|| {
            set.scenarios
                .par_iter()
                .zip(indexes.par_iter())
                .map(solve_one)
                .collect()
        }),
        // Degraded environment: same isolation, no parallelism.
        Err(_) => set
            .scenarios
            .iter()
            .zip(indexes.iter())
            .map(solve_one)
            .collect(),
    }
}
