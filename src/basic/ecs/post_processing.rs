use bevy_ecs::{prelude::*, system::RunSystemOnce};
use nalgebra::DVector;
use num_complex::Complex64;
use tabled::{Table, Tabled, settings::Style};

use super::elements::*;
use super::network::{DataOps, GridModel};
use super::systems::{PowerFlowResult, SolverStates};
use super::topology::Topology;

/// Computed complex voltage at a node, per-unit (phase a in the three-phase
/// representation).
#[derive(Component, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VBusResult(pub Complex64);

/// Computed injected power at a node, per-unit.
#[derive(Component, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SBusResult(pub Complex64);

/// Computed branch flow quantities, physical units.
#[derive(Component, Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BranchResultData {
    pub p_from_mw: f64,
    pub q_from_mvar: f64,
    pub p_to_mw: f64,
    pub q_to_mvar: f64,
    pub loss_mw: f64,
}

/// Fixed-precision cell for result tables.
struct Cell(f64, usize);

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.*}", self.1, self.0)
    }
}

#[derive(Tabled)]
#[allow(non_snake_case)]
struct BusRow {
    Bus: i64,
    Vm_pu: Cell,
    Va_deg: Cell,
    P_mw: Cell,
    Q_mvar: Cell,
}

#[derive(Tabled)]
#[allow(non_snake_case)]
struct BranchRow {
    From: i64,
    To: i64,
    P_from_mw: Cell,
    Q_from_mvar: Cell,
    P_to_mw: Cell,
    Q_to_mvar: Cell,
    Loss_mw: Cell,
}

/// Maps the latest power flow result back onto the node entities.
fn extract_res_bus(
    mut cmd: Commands,
    nodes: Res<NodeLookup>,
    topo: Res<Topology>,
    states: Res<SolverStates>,
    res: Res<PowerFlowResult>,
) {
    let Some(state) = [states.sym.as_ref(), states.asym.as_ref()]
        .into_iter()
        .flatten()
        .find(|s| s.v_init.len() == res.v.len())
    else {
        return;
    };
    let ph = state.mode.phases();

    let v_perm = DVector::from_fn(res.v.len(), |i, _| {
        res.v[state.from_perm[i / ph] * ph + i % ph]
    });
    let mis = v_perm.component_mul(&(&state.y_bus * &v_perm).conjugate());

    for (bus_id, entity) in nodes.iter() {
        let Some(pos) = topo.position(bus_id) else {
            continue;
        };
        let row = state.to_perm[pos] * ph;
        cmd.entity(entity)
            .insert((VBusResult(res.v[pos * ph]), SBusResult(mis[row])));
    }
}

/// Computes per-branch flows from the solved voltages.
fn extract_res_branch(
    mut cmd: Commands,
    topo: Res<Topology>,
    common: Res<CommonData>,
    res: Res<PowerFlowResult>,
    states: Res<SolverStates>,
    branches: Query<
        (
            Entity,
            &Port2,
            &Admittance,
            &ShuntAdmittance,
            &VBase,
            &EnergizedStatus,
        ),
        With<Branch>,
    >,
) {
    let Some(state) = [states.sym.as_ref(), states.asym.as_ref()]
        .into_iter()
        .flatten()
        .find(|s| s.v_init.len() == res.v.len())
    else {
        return;
    };
    let ph = state.mode.phases();
    let sbase = common.sbase;

    for (entity, port, y, ysh, vbase, status) in branches.iter() {
        if !status.0 {
            cmd.entity(entity).insert(BranchResultData::default());
            continue;
        }
        let (Some(i), Some(j)) = (topo.position(port.0[0]), topo.position(port.0[1])) else {
            continue;
        };
        let factor = vbase.0 * vbase.0 / sbase;
        let y_pu = y.0 * factor;
        let ysh_pu = ysh.0 * factor;

        let v_from = res.v[i * ph];
        let v_to = res.v[j * ph];
        let i_from = (v_from - v_to) * y_pu + v_from * ysh_pu * 0.5;
        let i_to = (v_to - v_from) * y_pu + v_to * ysh_pu * 0.5;
        let s_from = v_from * i_from.conj() * sbase;
        let s_to = v_to * i_to.conj() * sbase;

        cmd.entity(entity).insert(BranchResultData {
            p_from_mw: s_from.re,
            q_from_mvar: s_from.im,
            p_to_mw: s_to.re,
            q_to_mvar: s_to.im,
            loss_mw: s_from.re + s_to.re,
        });
    }
}

fn print_res_bus(q: Query<(&BusID, &VBusResult, &SBusResult)>, common: Res<CommonData>) {
    let mut rows: Vec<(i64, Complex64, Complex64)> =
        q.iter().map(|(b, v, s)| (b.0, v.0, s.0)).collect();
    rows.sort_by_key(|r| r.0);

    let table = rows.into_iter().map(|(bus, v, s)| BusRow {
        Bus: bus,
        Vm_pu: Cell(v.norm(), 4),
        Va_deg: Cell(v.arg().to_degrees(), 3),
        P_mw: Cell(s.re * common.sbase, 4),
        Q_mvar: Cell(s.im * common.sbase, 4),
    });
    let table = Table::new(table).with(Style::markdown()).to_string();
    println!("{table}");
}

fn print_res_branch(q: Query<(&Port2, &BranchResultData)>) {
    let table = q.iter().map(|(port, data)| BranchRow {
        From: port.0[0],
        To: port.0[1],
        P_from_mw: Cell(data.p_from_mw, 4),
        Q_from_mvar: Cell(data.q_from_mvar, 4),
        P_to_mw: Cell(data.p_to_mw, 4),
        Q_to_mvar: Cell(data.q_to_mvar, 4),
        Loss_mw: Cell(data.loss_mw, 4),
    });
    let table = Table::new(table).with(Style::markdown()).to_string();
    println!("{table}");
}

/// Trait for post-processing after a solve.
pub trait PostProcessing {
    /// Maps the latest result onto node and branch entities.
    fn post_process(&mut self);

    /// Prints the node results as a markdown table.
    fn print_res_bus(&mut self);

    /// Prints the branch results as a markdown table.
    fn print_res_branch(&mut self);
}

impl PostProcessing for GridModel {
    fn post_process(&mut self) {
        self.world_mut().run_system_once(extract_res_bus).unwrap();
        self.world_mut().run_system_once(extract_res_branch).unwrap();
    }

    fn print_res_bus(&mut self) {
        self.world_mut().run_system_once(print_res_bus).unwrap();
    }

    fn print_res_branch(&mut self) {
        self.world_mut().run_system_once(print_res_branch).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::ecs::cache::SymmetryMode;
    use crate::basic::ecs::testing::feeder_model;

    /// After a converged solve, every node carries voltage/power results and
    /// branch flows balance against the losses.
    #[test]
    fn test_post_process_inserts_results() {
        let mut model = feeder_model();
        model.solve_power_flow(SymmetryMode::Symmetric).unwrap();
        model.post_process();
        model.print_res_bus();
        model.print_res_branch();

        let world = model.world_mut();
        let mut nodes = world.query::<(&BusID, &VBusResult, &SBusResult)>();
        assert_eq!(nodes.iter(world).count(), 3);

        let mut branches = world.query::<&BranchResultData>();
        for data in branches.iter(world) {
            assert!(data.loss_mw >= 0.0, "negative branch loss {}", data.loss_mw);
            assert!(data.p_from_mw.is_finite());
        }
    }
}
