use bevy_app::prelude::*;
use bevy_ecs::component::Mutable;
use bevy_ecs::system::RunSystemOnce;
use bevy_ecs::{prelude::*, world::error::EntityMutableFetchError};
use nalgebra::DVector;
use num_complex::Complex64;
use tracing::info;

use crate::basic::error::{SolverError, SolverResult};
use crate::basic::estimation::{MeasuredValue, MeasurementGraph, MeasurementKind};
use crate::basic::iterative::iterative_current_pf;
use crate::basic::newton_pf;
use crate::basic::shortcircuit::{
    FaultStamp, FaultType, VoltageScaling, current_base_ka, solve_fault,
};

use super::batch::{UpdateScenario, apply_scenario};
use super::cache::{CacheStatus, SymmetryMode};
use super::elements::*;
use super::plugin::BaseModelPlugins;
use super::systems::*;
use super::topology::{
    Topology, UpdateClass, build_elimination_order, classify_update, extract_topology,
};

/// Resource that holds the state estimation configuration options.
#[derive(Debug, Default, Resource, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateEstimationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_it: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tol: Option<f64>,
}

/// Resource for the results of the latest state estimation.
#[derive(Debug, Default, Resource, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StateEstimationResult {
    pub v: DVector<Complex64>,
    pub iterations: usize,
}

/// Resource that selects the voltage-factor rule for short circuit solves.
#[derive(Debug, Resource, Clone, serde::Serialize, serde::Deserialize)]
pub struct ShortCircuitConfig {
    pub scaling: VoltageScaling,
}

impl Default for ShortCircuitConfig {
    fn default() -> Self {
        ShortCircuitConfig {
            scaling: VoltageScaling::Maximum,
        }
    }
}

/// One fault case to evaluate.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FaultSpec {
    pub bus: i64,
    pub fault_type: FaultType,
    /// Fault impedance in ohm; zero means a bolted fault.
    pub z_fault_ohm: Complex64,
}

/// Results of a short circuit solve.
#[derive(Debug, Default, Resource, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShortCircuitResult {
    /// Fault current per faulted phase conductor, per-unit.
    pub i_fault_pu: Vec<Complex64>,
    /// Fault current magnitudes in kA at the faulted node's rated voltage.
    pub i_fault_ka: Vec<f64>,
    /// Post-fault voltages in original node order, one entry per node/phase.
    pub v_post: DVector<Complex64>,
}

/// The model instance: an ECS world holding the component graph, its derived
/// topology/matrices and the cache bookkeeping that decides which stages may
/// be skipped.
#[derive(Default)]
pub struct GridModel {
    data_storage: App,
}

/// Trait for performing operations on ECS data, such as getting and mutating
/// components of entities.
pub trait DataOps {
    fn get_entity_mut(
        &mut self,
        entity: Entity,
    ) -> Result<EntityWorldMut<'_>, EntityMutableFetchError>;
    fn get_mut<T>(&'_ mut self, entity: Entity) -> Option<Mut<'_, T>>
    where
        T: Component<Mutability = Mutable>;
    fn get<T>(&self, entity: Entity) -> Option<&T>
    where
        T: Component;
    fn world_mut(&mut self) -> &mut World;
    fn world(&self) -> &World;
}

impl DataOps for GridModel {
    fn world(&self) -> &World {
        self.app().world()
    }
    fn world_mut(&mut self) -> &mut World {
        self.app_mut().world_mut()
    }
    fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        self.world().get(entity)
    }
    fn get_mut<T>(&'_ mut self, entity: Entity) -> Option<Mut<'_, T>>
    where
        T: Component<Mutability = Mutable>,
    {
        self.world_mut().get_mut(entity)
    }
    fn get_entity_mut(
        &mut self,
        entity: Entity,
    ) -> Result<EntityWorldMut<'_>, EntityMutableFetchError> {
        self.world_mut().get_entity_mut(entity)
    }
}

impl GridModel {
    pub fn app(&self) -> &App {
        &self.data_storage
    }

    pub fn app_mut(&mut self) -> &mut App {
        &mut self.data_storage
    }

    /// Initializes the model: registers resources and startup systems, then
    /// runs them once over the spawned component graph.
    pub fn init_model(&mut self) {
        self.app_mut().add_plugins(BaseModelPlugins);

        let world = self.world_mut();
        let mut schedules = world.get_resource_mut::<Schedules>().unwrap();
        let mut startup = schedules.remove(Startup).unwrap();
        startup.run(world);
    }

    /// Classifies and commits an update scenario onto the component graph,
    /// adjusting the cache status and, for switching changes, re-deriving the
    /// topology and elimination order at once.
    pub fn commit_update(&mut self, scenario: &UpdateScenario) -> SolverResult<UpdateClass> {
        let class = classify_update(self.world(), scenario);
        if class == UpdateClass::NoChange {
            return Ok(class);
        }

        apply_scenario(self.world_mut(), scenario);
        match class {
            UpdateClass::TopologyChanged => {
                self.world_mut()
                    .resource_mut::<CacheStatus>()
                    .note_topology_change();
                self.world_mut().run_system_once(extract_topology).unwrap();
                self.world_mut()
                    .run_system_once(build_elimination_order)
                    .unwrap();
                info!("committed switching update, topology re-derived");
            }
            UpdateClass::ParamOnly => {
                let ids = scenario.records.iter().map(|r| r.id);
                self.world_mut()
                    .resource_mut::<CacheStatus>()
                    .note_param_change(ids.collect::<Vec<_>>());
            }
            UpdateClass::NoChange => {}
        }
        Ok(class)
    }

    /// Brings the solver state of the requested representation up to date,
    /// doing as little as the cache allows: nothing, an in-place value
    /// refresh, or a full structural rebuild.
    pub fn ensure_solver_state(&mut self, mode: SymmetryMode) -> SolverResult<()> {
        let needs_structure = {
            let cache = self.world().resource::<CacheStatus>();
            cache.needs_structure(mode) || self.world().resource::<SolverStates>().get(mode).is_none()
        };

        if needs_structure {
            let generation = self
                .world_mut()
                .resource_mut::<CacheStatus>()
                .next_generation();
            let state = build_solver_state(self.world_mut(), mode, generation);
            self.world_mut().resource_mut::<SolverStates>().set(state);
            self.world_mut()
                .resource_mut::<CacheStatus>()
                .note_structure_built(mode, generation);
            return Ok(());
        }

        let needs_values = self.world().resource::<CacheStatus>().needs_values(mode);
        if needs_values {
            let generation = self
                .world_mut()
                .resource_mut::<CacheStatus>()
                .next_generation();
            let changed = self.world().resource::<CacheStatus>().mode(mode).changed.clone();
            let mut state = match mode {
                SymmetryMode::Symmetric => self.world_mut().resource_mut::<SolverStates>().sym.take(),
                SymmetryMode::Asymmetric => {
                    self.world_mut().resource_mut::<SolverStates>().asym.take()
                }
            }
            .expect("state presence checked above");
            refresh_solver_state(self.world_mut(), &mut state, &changed, generation);
            self.world_mut().resource_mut::<SolverStates>().set(state);
            self.world_mut()
                .resource_mut::<CacheStatus>()
                .note_values_refreshed(mode, generation);
        }
        Ok(())
    }

    fn check_supplied(&self) -> SolverResult<()> {
        let topo = self.world().resource::<Topology>();
        let unsupplied = topo.supplied.iter().filter(|&&s| !s).count();
        if unsupplied > 0 {
            return Err(SolverError::IllPosed {
                what: format!("{unsupplied} island(s) without an energized source"),
            });
        }
        Ok(())
    }

    fn check_generation(&self, mode: SymmetryMode) -> SolverResult<()> {
        let cache = self.world().resource::<CacheStatus>();
        let state = self.world().resource::<SolverStates>().get(mode).unwrap();
        if state.generation != cache.mode(mode).matrix_generation {
            return Err(SolverError::CacheConsistency {
                what: format!(
                    "solver state generation {} does not match committed generation {}",
                    state.generation,
                    cache.mode(mode).matrix_generation
                ),
            });
        }
        Ok(())
    }

    /// Runs a power flow in the requested representation. Repeated solves
    /// without intervening updates return the cached result untouched.
    pub fn solve_power_flow(&mut self, mode: SymmetryMode) -> SolverResult<PowerFlowResult> {
        self.ensure_solver_state(mode)?;
        self.check_supplied()?;
        self.check_generation(mode)?;

        {
            let cache = self.world().resource::<CacheStatus>();
            let state = self.world().resource::<SolverStates>().get(mode).unwrap();
            if !cache.needs_structure(mode) && !cache.needs_values(mode) {
                if let Some(res) = &state.last_result {
                    return Ok(res.clone());
                }
            }
        }

        let cfg = self.world().resource::<PowerFlowConfig>().clone();
        let outcome = self
            .world_mut()
            .resource_scope(|world, mut pf: Mut<PowerFlowSolver>| {
                let state = world.resource::<SolverStates>().get(mode).unwrap();
                let solved = match cfg.strategy {
                    PfStrategy::NewtonRaphson => newton_pf(
                        &state.y_bus,
                        &state.s_bus,
                        &state.v_init,
                        state.npv,
                        state.npq,
                        cfg.tolerance(),
                        cfg.max_iterations(),
                        &mut pf.solver,
                    ),
                    PfStrategy::IterativeCurrent => iterative_current_pf(
                        &state.y_bus,
                        &state.s_bus,
                        &state.v_init,
                        state.npv,
                        state.npq,
                        cfg.tolerance(),
                        cfg.max_iterations(),
                        &mut pf.solver,
                    ),
                };
                solved.map(|(v, iterations)| PowerFlowResult {
                    v: state.to_original_order(&v),
                    iterations,
                    converged: true,
                })
            })?;

        let world = self.world_mut();
        world
            .resource_mut::<SolverStates>()
            .get_mut(mode)
            .unwrap()
            .last_result = Some(outcome.clone());
        world.insert_resource(outcome.clone());
        world.resource_mut::<CacheStatus>().note_solved(mode);
        Ok(outcome)
    }

    /// Runs the weighted-least-squares state estimation over the sensors in
    /// the component graph.
    pub fn solve_state_estimation(
        &mut self,
        mode: SymmetryMode,
    ) -> SolverResult<StateEstimationResult> {
        self.ensure_solver_state(mode)?;
        self.check_supplied()?;
        self.check_generation(mode)?;

        let measurements = self.collect_measurements(mode)?;
        let cfg = self.world().resource::<StateEstimationConfig>().clone();
        let outcome = self
            .world_mut()
            .resource_scope(|world, mut pf: Mut<PowerFlowSolver>| {
                let state = world.resource::<SolverStates>().get(mode).unwrap();
                let graph =
                    MeasurementGraph::build(&state.y_bus, state.v_init.len(), measurements)?;
                graph
                    .solve(
                        &state.v_init,
                        cfg.tol.unwrap_or(1e-8),
                        cfg.max_it.unwrap_or(100),
                        &mut pf.solver,
                    )
                    .map(|(v, iterations)| StateEstimationResult {
                        v: state.to_original_order(&v),
                        iterations,
                    })
            })?;

        let world = self.world_mut();
        world.insert_resource(outcome.clone());
        world.resource_mut::<CacheStatus>().note_solved(mode);
        Ok(outcome)
    }

    /// Builds the measurement set from sensor entities, rejecting placements
    /// without defined terminal semantics before any numeric work.
    fn collect_measurements(&mut self, mode: SymmetryMode) -> SolverResult<Vec<MeasuredValue>> {
        let ph = mode.phases();
        let world = self.world_mut();

        struct RawSensor {
            measured: i64,
            variance: f64,
            voltage: Option<(f64, f64)>,
            power: Option<(f64, f64)>,
            current: Option<Complex64>,
        }

        let mut raw = Vec::new();
        {
            let mut q = world.query_filtered::<(
                &MeasuredElem,
                &Variance,
                Option<&VoltageSensor>,
                Option<&PowerSensor>,
                Option<&CurrentSensor>,
            ), With<ElemID>>();
            for (measured, variance, vs, ps, cs) in q.iter(world) {
                if vs.is_none() && ps.is_none() && cs.is_none() {
                    continue;
                }
                raw.push(RawSensor {
                    measured: measured.0,
                    variance: variance.0,
                    voltage: vs.map(|v| (v.vm_pu, v.va_rad)),
                    power: ps.map(|p| (p.p_mw, p.q_mvar)),
                    current: cs.map(|c| c.0),
                });
            }
        }

        let sbase = world.resource::<CommonData>().sbase;
        let topo = world.resource::<Topology>().clone();
        let node_ids: std::collections::HashSet<i64> = topo.bus_ids.iter().copied().collect();

        // An appliance reference resolves to the node it is connected to;
        // anything else has no terminal for a sensor to sit on.
        let mut appliance_bus = std::collections::HashMap::new();
        {
            let mut q = world.query::<(&ElemID, &TargetBus)>();
            for (elem, bus) in q.iter(world) {
                appliance_bus.insert(elem.0, bus.0);
            }
        }
        let mut branch_ids = std::collections::HashSet::new();
        {
            let mut q = world.query_filtered::<&ElemID, With<Branch>>();
            for elem in q.iter(world) {
                branch_ids.insert(elem.0);
            }
        }

        let state = world.resource::<SolverStates>().get(mode).unwrap();
        let mut measurements = Vec::new();
        for sensor in raw {
            // Voltage sensors measure nodes; power/current sensors sit on an
            // appliance terminal or measure a node injection. Branches offer
            // no terminal for either in this representation.
            let bus_id = if sensor.voltage.is_some() {
                if !node_ids.contains(&sensor.measured) {
                    return Err(SolverError::Config {
                        what: format!(
                            "voltage sensor must measure a node, not component {}",
                            sensor.measured
                        ),
                    });
                }
                sensor.measured
            } else if branch_ids.contains(&sensor.measured) {
                return Err(SolverError::Config {
                    what: format!(
                        "power sensor on branch {} has no terminal semantics here",
                        sensor.measured
                    ),
                });
            } else if let Some(&bus) = appliance_bus.get(&sensor.measured) {
                bus
            } else if node_ids.contains(&sensor.measured) {
                sensor.measured
            } else {
                return Err(SolverError::Config {
                    what: format!("sensor references unknown component {}", sensor.measured),
                });
            };
            let pos = topo.position(bus_id).ok_or_else(|| SolverError::Config {
                what: format!("sensor references unknown node {bus_id}"),
            })?;
            let base_row = state.to_perm[pos] * ph;

            for k in 0..ph {
                let shift = -(k as f64) * 2.0 * std::f64::consts::PI / 3.0;
                if let Some((vm, va)) = sensor.voltage {
                    measurements.push(MeasuredValue {
                        node: base_row + k,
                        kind: MeasurementKind::Voltage {
                            vm_pu: vm,
                            va_rad: if va.is_nan() { f64::NAN } else { va + shift },
                        },
                        variance: sensor.variance,
                    });
                }
                if let Some((p, q)) = sensor.power {
                    let s = Complex64::new(p, q) / sbase;
                    measurements.push(MeasuredValue {
                        node: base_row + k,
                        kind: MeasurementKind::PowerInjection { s },
                        variance: sensor.variance,
                    });
                }
                if let Some(i) = sensor.current {
                    let rotated = i * Complex64::from_polar(1.0, shift);
                    measurements.push(MeasuredValue {
                        node: base_row + k,
                        kind: MeasurementKind::CurrentInjection { i: rotated },
                        variance: sensor.variance,
                    });
                }
            }
        }
        Ok(measurements)
    }

    /// Solves one IEC 60909 fault case against the cached matrix augmented
    /// with the source internal admittances.
    pub fn solve_short_circuit(
        &mut self,
        mode: SymmetryMode,
        fault: &FaultSpec,
    ) -> SolverResult<ShortCircuitResult> {
        if mode == SymmetryMode::Symmetric && fault.fault_type != FaultType::ThreePhase {
            return Err(SolverError::Config {
                what: format!(
                    "{:?} faults need the three-phase representation",
                    fault.fault_type
                ),
            });
        }

        self.ensure_solver_state(mode)?;
        self.check_generation(mode)?;
        let ph = mode.phases();

        let snapshot = collect_graph(self.world_mut());
        let c = self.world().resource::<ShortCircuitConfig>().scaling.factor();
        let topo = self.world().resource::<Topology>().clone();
        let pos = topo.position(fault.bus).ok_or_else(|| SolverError::Config {
            what: format!("fault references unknown node {}", fault.bus),
        })?;

        let vn_fault = {
            let mut vn = 0.0;
            let world = self.world_mut();
            let mut q = world.query::<(&BusID, &VNominal)>();
            for (b, v) in q.iter(world) {
                if b.0 == fault.bus {
                    vn = v.0;
                }
            }
            vn
        };
        let sbase = snapshot.sbase;

        let state = self.world().resource::<SolverStates>().get(mode).unwrap();
        // Fault-augmented admittance: the cached matrix plus the source
        // internal admittances; load currents are neglected per IEC 60909.
        let n_s = state.v_init.len();
        let mut ybus = nalgebra_sparse::CooMatrix::new(n_s, n_s);
        for (r, col, v) in state.y_bus.triplet_iter() {
            ybus.push(r, col, *v);
        }
        let mut i_src: DVector<Complex64> = DVector::zeros(n_s);
        for src in &snapshot.sources {
            let y_pu = src.factor * (Complex64::new(1.0, 0.0) / src.z_ohm);
            for k in 0..ph {
                let row = state.to_perm[src.pos] * ph + k;
                ybus.push(row, row, y_pu);
                let shift = -(k as f64) * 2.0 * std::f64::consts::PI / 3.0;
                let e = Complex64::from_polar(c * src.vm_pu, src.va_deg.to_radians() + shift);
                i_src[row] += y_pu * e;
            }
        }
        let ybus = nalgebra_sparse::CscMatrix::from(&ybus);

        let z_fault_pu = fault.z_fault_ohm * sbase / (vn_fault * vn_fault);
        let base = state.to_perm[pos] * ph;
        let stamp = match fault.fault_type {
            FaultType::ThreePhase => FaultStamp::ToGround {
                rows: (0..ph).map(|k| base + k).collect(),
                z_fault: z_fault_pu,
            },
            FaultType::SinglePhaseGround => FaultStamp::ToGround {
                rows: vec![base],
                z_fault: z_fault_pu,
            },
            FaultType::TwoPhaseGround => FaultStamp::ToGround {
                rows: vec![base + 1, base + 2],
                z_fault: z_fault_pu,
            },
            FaultType::TwoPhase => FaultStamp::Bridge {
                a: base + 1,
                b: base + 2,
                z_fault: z_fault_pu,
            },
        };

        let to_perm = state.to_perm.clone();
        let mode_copy = state.mode;
        let outcome = self
            .world_mut()
            .resource_scope(|_world, mut pf: Mut<PowerFlowSolver>| {
                solve_fault(&ybus, &i_src, &stamp, &mut pf.solver)
            })?;

        let (v_solver, i_fault_pu) = outcome;
        let i_base = current_base_ka(sbase, vn_fault);
        let result = ShortCircuitResult {
            i_fault_ka: i_fault_pu.iter().map(|i| i.norm() * i_base).collect(),
            i_fault_pu,
            v_post: {
                let ph = mode_copy.phases();
                DVector::from_fn(v_solver.len(), |i, _| v_solver[to_perm[i / ph] * ph + i % ph])
            },
        };
        self.world_mut().insert_resource(result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::ecs::batch::UpdateRecord;
    use crate::basic::ecs::testing::feeder_model;
    use crate::basic::ecs::topology::EliminationOrderRes;
    use nalgebra::Complex;

    fn one_record(record: UpdateRecord) -> UpdateScenario {
        UpdateScenario {
            records: vec![record],
        }
    }

    #[test]
    fn test_power_flow_converges() {
        let mut model = feeder_model();
        let res = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        assert!(res.converged);
        assert_eq!(res.v[0], Complex64::new(1.0, 0.0));
        let vm2 = res.v[2].norm();
        assert!(vm2 < 1.0 && vm2 > 0.95, "end-of-feeder voltage {vm2}");
    }

    /// Solving twice without an intervening update reuses the cache and
    /// returns bit-identical results.
    #[test]
    fn test_repeat_solve_bit_identical() {
        let mut model = feeder_model();
        let r1 = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        let gen1 = model
            .world()
            .resource::<SolverStates>()
            .get(SymmetryMode::Symmetric)
            .unwrap()
            .generation;
        let r2 = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        let gen2 = model
            .world()
            .resource::<SolverStates>()
            .get(SymmetryMode::Symmetric)
            .unwrap()
            .generation;
        assert_eq!(r1, r2);
        assert_eq!(gen1, gen2);
    }

    /// Parameter-only updates keep the derived topology and elimination
    /// order instances, generation included.
    #[test]
    fn test_param_update_keeps_topology() {
        let mut model = feeder_model();
        model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        let topo_gen = model.world().resource::<Topology>().generation;
        let order_gen = model.world().resource::<EliminationOrderRes>().generation;

        let class = model
            .commit_update(&one_record(UpdateRecord {
                p_mw: Some(7.5),
                ..UpdateRecord::new(300)
            }))
            .unwrap();
        assert_eq!(class, UpdateClass::ParamOnly);
        let res = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        assert!(res.converged);

        assert_eq!(model.world().resource::<Topology>().generation, topo_gen);
        assert_eq!(
            model.world().resource::<EliminationOrderRes>().generation,
            order_gen
        );
    }

    /// A genuine switching change invalidates topology for both
    /// representations.
    #[test]
    fn test_status_change_invalidates_both_modes() {
        let mut model = feeder_model();
        model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        let topo_gen = model.world().resource::<Topology>().generation;

        let class = model
            .commit_update(&one_record(UpdateRecord {
                status: Some(false),
                ..UpdateRecord::new(101)
            }))
            .unwrap();
        assert_eq!(class, UpdateClass::TopologyChanged);

        let cache = model.world().resource::<CacheStatus>();
        assert!(cache.needs_structure(SymmetryMode::Symmetric));
        assert!(cache.needs_structure(SymmetryMode::Asymmetric));
        assert!(model.world().resource::<Topology>().generation > topo_gen);
    }

    /// An island cut off from every source is ill-posed, not divergent.
    #[test]
    fn test_unsupplied_island_ill_posed() {
        let mut model = feeder_model();
        model
            .commit_update(&one_record(UpdateRecord {
                status: Some(false),
                ..UpdateRecord::new(101)
            }))
            .unwrap();
        let err = model.solve_power_flow(SymmetryMode::Symmetric).unwrap_err();
        assert!(matches!(err, SolverError::IllPosed { .. }), "got {err:?}");
    }

    /// An infeasible loading never meets the tolerance: the diagnosis carries
    /// exactly the configured cap and tolerance.
    #[test]
    fn test_divergence_diagnosis() {
        let mut model = feeder_model();
        model.world_mut().insert_resource(PowerFlowConfig {
            max_it: Some(20),
            tol: Some(1e-8),
            strategy: PfStrategy::NewtonRaphson,
        });
        model
            .commit_update(&one_record(UpdateRecord {
                p_mw: Some(8000.0),
                ..UpdateRecord::new(300)
            }))
            .unwrap();
        let err = model.solve_power_flow(SymmetryMode::Symmetric).unwrap_err();
        match err {
            SolverError::Divergence {
                iterations,
                tolerance,
                ..
            } => {
                assert_eq!(iterations, 20);
                assert_eq!(tolerance, 1e-8);
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    /// A solver state whose generation no longer matches the committed cache
    /// status is refused outright.
    #[test]
    fn test_generation_mismatch_detected() {
        let mut model = feeder_model();
        model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        model
            .world_mut()
            .resource_mut::<SolverStates>()
            .get_mut(SymmetryMode::Symmetric)
            .unwrap()
            .generation = 999;
        let err = model.solve_power_flow(SymmetryMode::Symmetric).unwrap_err();
        assert!(matches!(err, SolverError::CacheConsistency { .. }));
    }

    /// Single source node, bolted three-phase fault: `I_k = c U / (sqrt(3) Z)`
    /// and the faulted node voltage collapses to zero.
    #[test]
    fn test_short_circuit_round_trip() {
        let mut model = GridModel::default();
        {
            let world = model.world_mut();
            world.spawn(BusBundle {
                bus_id: BusID(0),
                vn_kv: VNominal(10.0),
            });
            world.spawn(SourceBundle {
                elem_id: ElemID(200),
                bus: TargetBus(0),
                z: SourceImpedance(Complex::new(0.0, 0.5)),
                ..Default::default()
            });
        }
        model.init_model();

        let res = model
            .solve_short_circuit(
                SymmetryMode::Symmetric,
                &FaultSpec {
                    bus: 0,
                    fault_type: FaultType::ThreePhase,
                    z_fault_ohm: Complex64::default(),
                },
            )
            .unwrap();

        let c = 1.10;
        let expected_ka = c * 10.0 / (3.0f64.sqrt() * 0.5);
        assert!((res.i_fault_ka[0] - expected_ka).abs() < 1e-9);
        assert!(res.v_post[0].norm() < 1e-12);
    }

    /// Phase faults are rejected in the single-phase-equivalent
    /// representation before any numeric work.
    #[test]
    fn test_phase_fault_needs_asymmetric() {
        let mut model = feeder_model();
        let err = model
            .solve_short_circuit(
                SymmetryMode::Symmetric,
                &FaultSpec {
                    bus: 1,
                    fault_type: FaultType::SinglePhaseGround,
                    z_fault_ohm: Complex64::default(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, SolverError::Config { .. }));
    }

    /// A single-phase fault in the three-phase representation leaves the
    /// healthy phases closer to nominal than the faulted one.
    #[test]
    fn test_single_phase_fault_asymmetric() {
        let mut model = feeder_model();
        let res = model
            .solve_short_circuit(
                SymmetryMode::Asymmetric,
                &FaultSpec {
                    bus: 2,
                    fault_type: FaultType::SinglePhaseGround,
                    z_fault_ohm: Complex64::default(),
                },
            )
            .unwrap();
        let faulted = res.v_post[2 * 3].norm();
        let healthy = res.v_post[2 * 3 + 1].norm();
        assert!(faulted < 1e-9, "faulted phase voltage {faulted}");
        assert!(healthy > 0.5, "healthy phase voltage {healthy}");
        assert!(res.i_fault_ka[0] > 0.0);
    }

    /// Switching representations forces a value refresh, and switching back
    /// reproduces the original result.
    #[test]
    fn test_mode_switch_round_trip() {
        let mut model = feeder_model();
        let sym1 = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        let asym = model.solve_power_flow(SymmetryMode::Asymmetric).unwrap();
        let sym2 = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();

        assert_eq!(sym1.v, sym2.v);
        // Balanced network: phase a of the three-phase result matches the
        // single-phase-equivalent voltages.
        for pos in 0..3 {
            assert!((asym.v[pos * 3] - sym1.v[pos]).norm() < 1e-8);
        }
    }

    /// The two power flow strategies agree on the solved state.
    #[test]
    fn test_strategies_agree() {
        let mut model = feeder_model();
        let nr = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();

        model.world_mut().insert_resource(PowerFlowConfig {
            max_it: None,
            tol: None,
            strategy: PfStrategy::IterativeCurrent,
        });
        // Force a fresh solve through the fixed-point strategy.
        model
            .commit_update(&one_record(UpdateRecord {
                p_mw: Some(5.000001),
                ..UpdateRecord::new(300)
            }))
            .unwrap();
        let fp = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        for pos in 0..3 {
            assert!((nr.v[pos] - fp.v[pos]).norm() < 1e-4);
        }
    }

    /// A voltage-controlled generator holds its node at the magnitude target.
    #[test]
    fn test_generator_holds_voltage() {
        let mut model = feeder_model();
        model.world_mut().spawn(GenBundle {
            elem_id: ElemID(302),
            bus: TargetBus(2),
            p: TargetPMW(2.0),
            vm: TargetVmPu(1.02),
            ..Default::default()
        });

        let res = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        assert!(res.converged);
        assert!((res.v[2].norm() - 1.02).abs() < 1e-6);
    }

    /// State estimation over exact sensor readings reproduces the power flow
    /// voltages.
    #[test]
    fn test_state_estimation_matches_power_flow() {
        let mut model = feeder_model();
        // Sensors are matched by their components, not the id lookup, so
        // spawning them after init is fine.
        {
            let world = model.world_mut();
            world.spawn((
                ElemID(400),
                MeasuredElem(0),
                VoltageSensor {
                    vm_pu: 1.0,
                    va_rad: 0.0,
                },
                Variance(1e-6),
            ));
            world.spawn((
                ElemID(401),
                MeasuredElem(300),
                PowerSensor {
                    p_mw: -5.0,
                    q_mvar: -2.0,
                },
                Variance(1e-4),
            ));
            world.spawn((
                ElemID(402),
                MeasuredElem(301),
                PowerSensor {
                    p_mw: -3.0,
                    q_mvar: -1.0,
                },
                Variance(1e-4),
            ));
        }

        let pf = model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        let se = model
            .solve_state_estimation(SymmetryMode::Symmetric)
            .unwrap();
        for pos in 0..3 {
            assert!(
                (pf.v[pos] - se.v[pos]).norm() < 1e-3,
                "node {pos}: pf {} vs se {}",
                pf.v[pos],
                se.v[pos]
            );
        }
    }

    /// A power sensor on a branch has no terminal semantics here and is
    /// rejected before any numeric work.
    #[test]
    fn test_power_sensor_on_branch_rejected() {
        let mut model = feeder_model();
        model.world_mut().spawn((
            ElemID(400),
            MeasuredElem(100),
            PowerSensor {
                p_mw: 1.0,
                q_mvar: 0.0,
            },
            Variance(1e-4),
        ));
        let err = model
            .solve_state_estimation(SymmetryMode::Symmetric)
            .unwrap_err();
        assert!(matches!(err, SolverError::Config { .. }), "got {err:?}");
    }
}
