use bevy_app::{App, Plugin, Startup, plugin_group};
use bevy_ecs::prelude::*;

use super::cache::CacheStatus;
use super::elements::CommonData;
use super::elements::setup::{init_elem_lookup, init_node_lookup};
use super::network::{ShortCircuitConfig, StateEstimationConfig};
use super::systems::{PowerFlowConfig, PowerFlowSolver, SolverStates};
use super::topology::{build_elimination_order, extract_topology};

/// Startup stage deriving topology and elimination order from the spawned
/// component graph.
#[derive(Debug, SystemSet, Hash, Eq, PartialEq, Clone)]
pub struct ModelInitStage;

/// Registers the id lookups and common base data.
#[derive(Default)]
pub struct ElementSetupPlugin;

impl Plugin for ElementSetupPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<CommonData>();
        app.add_systems(
            Startup,
            (init_node_lookup, init_elem_lookup).before(ModelInitStage),
        );
    }
}

/// Derives the numeric topology and its elimination order once at startup;
/// committed switching updates re-run the same systems.
#[derive(Default)]
pub struct TopologyPlugin;

impl Plugin for TopologyPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(
            Startup,
            (extract_topology, build_elimination_order)
                .chain()
                .in_set(ModelInitStage),
        );
    }
}

/// Inserts the cache bookkeeping, solver backend and configuration defaults.
#[derive(Default)]
pub struct SolverSetupPlugin;

impl Plugin for SolverSetupPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<CacheStatus>();
        app.init_resource::<SolverStates>();
        app.init_resource::<PowerFlowSolver>();
        app.init_resource::<PowerFlowConfig>();
        app.init_resource::<StateEstimationConfig>();
        app.init_resource::<ShortCircuitConfig>();
    }
}

plugin_group! {
    /// Everything a model instance needs before the first solve.
    pub struct BaseModelPlugins {
        :ElementSetupPlugin,
        :TopologyPlugin,
        :SolverSetupPlugin,
    }
}

/// Creates a Bevy application with the base model plugins installed.
pub fn default_app() -> App {
    let mut app = App::new();
    app.add_plugins(BaseModelPlugins);
    app
}
