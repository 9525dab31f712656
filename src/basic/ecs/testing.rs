//! Shared fixtures for the solver test suites.

use nalgebra::{Complex, vector};

use super::elements::*;
use super::network::{DataOps, GridModel};

/// Captures solver tracing in test output.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Three-node radial feeder: source at node 0, loads at nodes 1 and 2,
/// branches 100 (0-1) and 101 (1-2). Initialized and ready to solve.
pub(crate) fn feeder_model() -> GridModel {
    init_tracing();
    let mut model = GridModel::default();
    let world = model.world_mut();
    for id in 0..3 {
        world.spawn(BusBundle {
            bus_id: BusID(id),
            vn_kv: VNominal(10.0),
        });
    }
    for (eid, (a, b)) in [(0i64, 1i64), (1, 2)].iter().enumerate() {
        world.spawn(BranchBundle {
            elem_id: ElemID(100 + eid as i64),
            port: Port2(vector![*a, *b]),
            // 0.01 + j0.03 ohm series impedance at the 10 kV base.
            y: Admittance(Complex::new(10.0, -30.0)),
            v_base: VBase(10.0),
            ..Default::default()
        });
    }
    world.spawn(SourceBundle {
        elem_id: ElemID(200),
        bus: TargetBus(0),
        z: SourceImpedance(Complex::new(0.05, 0.5)),
        ..Default::default()
    });
    world.spawn(LoadBundle {
        elem_id: ElemID(300),
        bus: TargetBus(1),
        p: TargetPMW(5.0),
        q: TargetQMVar(2.0),
        ..Default::default()
    });
    world.spawn(LoadBundle {
        elem_id: ElemID(301),
        bus: TargetBus(2),
        p: TargetPMW(3.0),
        q: TargetQMVar(1.0),
        ..Default::default()
    });
    model.init_model();
    model
}
