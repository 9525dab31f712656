mod basic;

pub mod prelude {
    use crate::basic;
    pub use basic::*;

    pub use ecs::{
        batch::{
            BatchClass, BatchUpdateSet, UpdateRecord, UpdateScenario, classify_batch,
            run_power_flow_batch,
        },
        cache::{CacheState, CacheStatus, LastSolvedMode, SymmetryMode},
        elements::*,
        network::{
            DataOps, FaultSpec, GridModel, ShortCircuitConfig, ShortCircuitResult,
            StateEstimationConfig, StateEstimationResult,
        },
        plugin::default_app,
        post_processing::PostProcessing,
        systems::{PfStrategy, PowerFlowConfig, PowerFlowResult},
        topology::{Topology, UpdateClass},
    };
    pub use error::{SolverError, SolverResult};
    pub use ordering::{EliminationOrder, min_degree_order};
    pub use shortcircuit::{FaultType, VoltageScaling};
}
