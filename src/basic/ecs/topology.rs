use bevy_ecs::prelude::*;
use derive_more::{Deref, DerefMut};
use std::collections::HashMap;
use tracing::debug;

use crate::basic::ordering::{EliminationOrder, min_degree_order};

use super::batch::UpdateScenario;
use super::elements::*;

/// How a batch update relates to the committed component graph.
///
/// Only a genuine change of a connection/enabled status attribute is
/// topology-changing; everything else at most refreshes numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    NoChange,
    ParamOnly,
    TopologyChanged,
}

/// Union-find over node positions, used to group electrically connected
/// nodes into islands.
#[derive(Default, Debug, Clone)]
pub struct IslandMerge {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl IslandMerge {
    pub fn new(count: usize) -> Self {
        IslandMerge {
            parent: (0..count).collect(),
            rank: vec![0; count],
        }
    }

    pub fn find(&mut self, node: usize) -> usize {
        let mut root = node;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut current = node;
        while self.parent[current] != root {
            let up = self.parent[current];
            self.parent[current] = root;
            current = up;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        if self.rank[ra] < self.rank[rb] {
            self.parent[ra] = rb;
        } else {
            self.parent[rb] = ra;
            if self.rank[ra] == self.rank[rb] {
                self.rank[ra] += 1;
            }
        }
    }
}

/// Numeric topology derived from the component graph and the committed
/// switching status.
///
/// Read-mostly: matrix builders and solvers borrow it, only the extraction
/// system replaces it. The generation ties matrices and elimination orders
/// back to the extraction they were derived from.
#[derive(Debug, Default, Clone, Resource)]
pub struct Topology {
    pub node_count: usize,
    /// Node position -> stable bus id.
    pub bus_ids: Vec<i64>,
    /// Stable bus id -> node position.
    pub pos: HashMap<i64, usize>,
    /// Energized branch endpoints as node positions, one entry per branch.
    pub edges: Vec<(usize, usize)>,
    /// Node position -> island index.
    pub island_of: Vec<usize>,
    /// Island index -> member node positions.
    pub islands: Vec<Vec<usize>>,
    /// Whether each island contains at least one energized source.
    pub supplied: Vec<bool>,
    pub generation: u64,
}

impl Topology {
    pub fn position(&self, bus_id: i64) -> Option<usize> {
        self.pos.get(&bus_id).copied()
    }

    pub fn all_supplied(&self) -> bool {
        self.supplied.iter().all(|&s| s)
    }
}

/// Elimination order cached alongside the topology it was computed from.
#[derive(Debug, Default, Clone, Resource, Deref, DerefMut)]
pub struct EliminationOrderRes(pub EliminationOrder);

/// Rebuilds the [`Topology`] resource from the current component graph.
///
/// Node positions are assigned by ascending bus id so extraction is
/// deterministic. Islands come from union-find over energized branches.
pub fn extract_topology(
    mut cmd: Commands,
    previous: Option<Res<Topology>>,
    buses: Query<&BusID>,
    branches: Query<(&Port2, &EnergizedStatus), With<Branch>>,
    sources: Query<(&TargetBus, &EnergizedStatus), With<Source>>,
) {
    let mut bus_ids: Vec<i64> = buses.iter().map(|b| b.0).collect();
    bus_ids.sort_unstable();
    let pos: HashMap<i64, usize> = bus_ids.iter().enumerate().map(|(i, &b)| (b, i)).collect();
    let node_count = bus_ids.len();

    let mut merge = IslandMerge::new(node_count);
    let mut edges = Vec::new();
    for (port, status) in branches.iter() {
        if !status.0 {
            continue;
        }
        let (Some(&i), Some(&j)) = (pos.get(&port.0[0]), pos.get(&port.0[1])) else {
            continue;
        };
        edges.push((i, j));
        merge.union(i, j);
    }

    let mut island_of = vec![usize::MAX; node_count];
    let mut islands: Vec<Vec<usize>> = Vec::new();
    let mut root_to_island: HashMap<usize, usize> = HashMap::new();
    for node in 0..node_count {
        let root = merge.find(node);
        let island = *root_to_island.entry(root).or_insert_with(|| {
            islands.push(Vec::new());
            islands.len() - 1
        });
        island_of[node] = island;
        islands[island].push(node);
    }

    let mut supplied = vec![false; islands.len()];
    for (bus, status) in sources.iter() {
        if status.0 {
            if let Some(&p) = pos.get(&bus.0) {
                supplied[island_of[p]] = true;
            }
        }
    }

    let generation = previous.map_or(1, |t| t.generation + 1);
    debug!(
        nodes = node_count,
        branches = edges.len(),
        islands = islands.len(),
        generation,
        "topology extracted"
    );

    cmd.insert_resource(Topology {
        node_count,
        bus_ids,
        pos,
        edges,
        island_of,
        islands,
        supplied,
        generation,
    });
}

/// Derives the elimination order for the current topology. Runs once per
/// extraction; parameter-only updates reuse the cached instance.
pub fn build_elimination_order(mut cmd: Commands, topo: Res<Topology>) {
    let mut order = min_degree_order(topo.node_count, topo.edges.iter().copied());
    order.generation = topo.generation;
    debug!(
        fills = order.fills.len(),
        generation = order.generation,
        "elimination order built"
    );
    cmd.insert_resource(EliminationOrderRes(order));
}

/// Classifies an update scenario against the committed component state.
///
/// A status field equal to the committed value, or left unspecified, does not
/// count as a change. Numeric fields equal to the committed value are also
/// treated as untouched, so re-sending the base case classifies as
/// [`UpdateClass::NoChange`].
pub fn classify_update(world: &World, scenario: &UpdateScenario) -> UpdateClass {
    let lookup = world.resource::<ElemLookup>();
    let mut class = UpdateClass::NoChange;

    for record in &scenario.records {
        let Some(&entity) = lookup.get(&record.id) else {
            continue;
        };

        if let Some(status) = record.status {
            let current = world
                .get::<EnergizedStatus>(entity)
                .map(|s| s.0)
                .unwrap_or(true);
            if status != current {
                return UpdateClass::TopologyChanged;
            }
        }

        let mut touched = false;
        if let Some(p) = record.p_mw {
            touched |= world.get::<TargetPMW>(entity).is_some_and(|c| c.0 != p);
        }
        if let Some(q) = record.q_mvar {
            touched |= world.get::<TargetQMVar>(entity).is_some_and(|c| c.0 != q);
        }
        if let Some(vm) = record.vm_pu {
            touched |= world.get::<TargetVmPu>(entity).is_some_and(|c| c.0 != vm);
        }
        if let Some(y) = record.y_series {
            touched |= world.get::<Admittance>(entity).is_some_and(|c| c.0 != y);
        }
        if touched {
            class = UpdateClass::ParamOnly;
        }
    }
    class
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::system::RunSystemOnce;
    use nalgebra::vector;

    pub(crate) fn spawn_three_bus(world: &mut World) {
        for id in 0..3 {
            world.spawn(BusBundle {
                bus_id: BusID(id),
                vn_kv: VNominal(10.0),
            });
        }
        for (eid, (a, b)) in [(0, 1), (1, 2)].iter().enumerate() {
            world.spawn(BranchBundle {
                elem_id: ElemID(100 + eid as i64),
                port: Port2(vector![*a, *b]),
                y: Admittance(nalgebra::Complex::new(1.0, -3.0)),
                v_base: VBase(10.0),
                ..Default::default()
            });
        }
        world.spawn(SourceBundle {
            elem_id: ElemID(200),
            bus: TargetBus(0),
            z: SourceImpedance(nalgebra::Complex::new(0.1, 1.0)),
            ..Default::default()
        });
        world.run_system_once(super::super::elements::setup::init_elem_lookup).unwrap();
        world.run_system_once(super::super::elements::setup::init_node_lookup).unwrap();
    }

    #[test]
    fn test_single_island_supplied() {
        let mut world = World::new();
        spawn_three_bus(&mut world);
        world.run_system_once(extract_topology).unwrap();

        let topo = world.resource::<Topology>();
        assert_eq!(topo.node_count, 3);
        assert_eq!(topo.islands.len(), 1);
        assert!(topo.all_supplied());
        assert_eq!(topo.generation, 1);
    }

    #[test]
    fn test_open_branch_splits_island() {
        let mut world = World::new();
        spawn_three_bus(&mut world);
        // Open the branch between bus 1 and bus 2.
        let mut q = world.query::<(&ElemID, &mut EnergizedStatus)>();
        for (id, mut status) in q.iter_mut(&mut world) {
            if id.0 == 101 {
                status.0 = false;
            }
        }
        world.run_system_once(extract_topology).unwrap();

        let topo = world.resource::<Topology>();
        assert_eq!(topo.islands.len(), 2);
        // The island holding bus 2 has no source.
        assert!(!topo.all_supplied());
        let p2 = topo.position(2).unwrap();
        assert!(!topo.supplied[topo.island_of[p2]]);
    }

    #[test]
    fn test_generation_increments() {
        let mut world = World::new();
        spawn_three_bus(&mut world);
        world.run_system_once(extract_topology).unwrap();
        world.run_system_once(extract_topology).unwrap();
        assert_eq!(world.resource::<Topology>().generation, 2);
    }

    #[test]
    fn test_classify_update_kinds() {
        use crate::basic::ecs::batch::UpdateRecord;

        let mut world = World::new();
        spawn_three_bus(&mut world);
        world.spawn(LoadBundle {
            elem_id: ElemID(300),
            bus: TargetBus(2),
            p: TargetPMW(5.0),
            q: TargetQMVar(1.0),
            ..Default::default()
        });
        world.run_system_once(super::super::elements::setup::init_elem_lookup).unwrap();

        // Unspecified fields only: no change.
        let noop = UpdateScenario {
            records: vec![UpdateRecord::new(300)],
        };
        assert_eq!(classify_update(&world, &noop), UpdateClass::NoChange);

        // Same status as committed: still no change.
        let same_status = UpdateScenario {
            records: vec![UpdateRecord {
                status: Some(true),
                ..UpdateRecord::new(101)
            }],
        };
        assert_eq!(classify_update(&world, &same_status), UpdateClass::NoChange);

        // Power delta only.
        let param = UpdateScenario {
            records: vec![UpdateRecord {
                p_mw: Some(7.5),
                ..UpdateRecord::new(300)
            }],
        };
        assert_eq!(classify_update(&world, &param), UpdateClass::ParamOnly);

        // Genuine status flip.
        let open = UpdateScenario {
            records: vec![UpdateRecord {
                status: Some(false),
                ..UpdateRecord::new(101)
            }],
        };
        assert_eq!(classify_update(&world, &open), UpdateClass::TopologyChanged);
    }

    #[test]
    fn test_union_find_groups() {
        let mut uf = IslandMerge::new(6);
        uf.union(0, 1);
        uf.union(1, 2);
        uf.union(4, 5);
        assert_eq!(uf.find(0), uf.find(2));
        assert_ne!(uf.find(2), uf.find(3));
        assert_eq!(uf.find(4), uf.find(5));
    }
}
