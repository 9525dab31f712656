use std::collections::HashMap;

use bevy_ecs::entity::EntityHash;
use bevy_ecs::prelude::*;
use derive_more::{Deref, DerefMut};
use nalgebra::{Complex, Vector2};
use num_complex::Complex64;

/// Stable identifier of an electrical node.
#[derive(Component, Debug, Default, Clone, Eq, Ord, PartialEq, PartialOrd)]
#[derive(serde::Serialize, serde::Deserialize)]
#[require(VNominal)]
pub struct BusID(pub i64);

/// Rated voltage of a node in kV. Used for per-unit conversion of the
/// admittances attached to it.
#[derive(Component, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VNominal(pub f64);

impl Default for VNominal {
    fn default() -> Self {
        VNominal(10.0)
    }
}

/// Stable identifier of a branch, appliance or sensor.
///
/// Identifiers are unique across all component kinds; the ingesting caller
/// guarantees this before the core runs.
#[derive(Component, Debug, Default, Clone, Eq, PartialEq, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ElemID(pub i64);

/// Connection/enabled status of a branch or appliance.
///
/// `false` removes the element from the electrical topology without removing
/// it from the component graph.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct EnergizedStatus(pub bool);

impl Default for EnergizedStatus {
    fn default() -> Self {
        EnergizedStatus(true)
    }
}

/// Series admittance of a branch, in siemens.
#[derive(Component, Clone, Default, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct Admittance(pub Complex<f64>);

/// Total shunt (charging) admittance of a branch, in siemens.
#[derive(Component, Clone, Default, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct ShuntAdmittance(pub Complex<f64>);

/// Mutual admittance between phases of a branch, in siemens. Only consumed by
/// the three-phase representation; zero means fully decoupled phases.
#[derive(Component, Clone, Default, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct PhaseCoupling(pub Complex<f64>);

/// The two node identifiers a branch connects.
#[derive(Component, Deref, DerefMut, Default, Debug, Clone, PartialEq)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Port2(pub Vector2<i64>);

/// Base voltage for per-unit conversion of an admittance, in kV.
#[derive(Debug, Component, Deref, DerefMut, Default, Clone)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct VBase(pub f64);

/// The node an appliance or shunt is connected to.
#[derive(Component, Debug, Default, Clone, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TargetBus(pub i64);

/// Marker for a series branch (line, transformer, closed link).
#[derive(Debug, Component, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Branch;

/// Marker for a voltage source / external grid connection.
#[derive(Debug, Component, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Source;

/// Marker for a load appliance.
#[derive(Debug, Component, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Load;

/// Marker for a generator appliance.
#[derive(Debug, Component, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Gen;

/// Marker for a shunt appliance.
#[derive(Debug, Component, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct EShunt;

/// Internal impedance of a source, in ohm. Drives the fault current the
/// source can feed during a short circuit.
#[derive(Component, Clone, Default, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
pub struct SourceImpedance(pub Complex<f64>);

/// Active power target in MW (injection positive).
#[derive(Component, Debug, Default, Clone, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TargetPMW(pub f64);

/// Reactive power target in MVar (injection positive).
#[derive(Component, Debug, Default, Clone, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TargetQMVar(pub f64);

/// Voltage magnitude target in per-unit (sources, voltage-controlled gens).
#[derive(Component, Debug, Clone, Deref, DerefMut, serde::Serialize, serde::Deserialize)]
pub struct TargetVmPu(pub f64);

impl Default for TargetVmPu {
    fn default() -> Self {
        TargetVmPu(1.0)
    }
}

/// Voltage angle target in degrees (sources only).
#[derive(Component, Debug, Default, Clone, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct TargetVaDeg(pub f64);

/// Voltage measurement: magnitude in per-unit and angle in radians.
/// A NaN angle means the angle was not measured.
#[derive(Component, Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VoltageSensor {
    pub vm_pu: f64,
    pub va_rad: f64,
}

/// Power measurement at a node or appliance terminal, in MW/MVar.
#[derive(Component, Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct PowerSensor {
    pub p_mw: f64,
    pub q_mvar: f64,
}

/// Current phasor measurement at a node or appliance terminal, in per-unit.
#[derive(Component, Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct CurrentSensor(pub Complex64);

/// Measurement variance (sigma squared) of a sensor.
#[derive(Component, Debug, Clone, Deref, DerefMut, serde::Serialize, serde::Deserialize)]
pub struct Variance(pub f64);

impl Default for Variance {
    fn default() -> Self {
        Variance(1e-4)
    }
}

/// Identifier of the component a sensor measures.
#[derive(Component, Debug, Default, Clone, Deref, DerefMut)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct MeasuredElem(pub i64);

/// Base quantities shared by every per-unit conversion.
#[derive(Debug, Resource, Clone, serde::Serialize, serde::Deserialize)]
pub struct CommonData {
    /// Base frequency in rad/s.
    pub wbase: f64,
    /// Base power in MVA.
    pub sbase: f64,
}

impl Default for CommonData {
    fn default() -> Self {
        CommonData {
            wbase: 2.0 * std::f64::consts::PI * 50.0,
            sbase: 100.0,
        }
    }
}

/// Bundle for spawning an electrical node.
#[derive(Bundle, Default)]
pub struct BusBundle {
    pub bus_id: BusID,
    pub vn_kv: VNominal,
}

/// Bundle for spawning a series branch.
#[derive(Bundle, Default)]
pub struct BranchBundle {
    pub marker: Branch,
    pub elem_id: ElemID,
    pub port: Port2,
    pub y: Admittance,
    pub y_shunt: ShuntAdmittance,
    pub v_base: VBase,
    pub status: EnergizedStatus,
}

/// Bundle for spawning a voltage source appliance.
#[derive(Bundle, Default)]
pub struct SourceBundle {
    pub marker: Source,
    pub elem_id: ElemID,
    pub bus: TargetBus,
    pub z: SourceImpedance,
    pub vm: TargetVmPu,
    pub va: TargetVaDeg,
    pub status: EnergizedStatus,
}

/// Bundle for spawning a load appliance.
#[derive(Bundle, Default)]
pub struct LoadBundle {
    pub marker: Load,
    pub elem_id: ElemID,
    pub bus: TargetBus,
    pub p: TargetPMW,
    pub q: TargetQMVar,
    pub status: EnergizedStatus,
}

/// Bundle for spawning a voltage-controlled generator appliance.
#[derive(Bundle, Default)]
pub struct GenBundle {
    pub marker: Gen,
    pub elem_id: ElemID,
    pub bus: TargetBus,
    pub p: TargetPMW,
    pub vm: TargetVmPu,
    pub status: EnergizedStatus,
}

/// Bundle for spawning a shunt appliance.
#[derive(Bundle, Default)]
pub struct ShuntBundle {
    pub marker: EShunt,
    pub elem_id: ElemID,
    pub bus: TargetBus,
    pub y: Admittance,
    pub v_base: VBase,
    pub status: EnergizedStatus,
}

/// Resource that maps node identifiers to ECS entities and back.
#[derive(Default, Debug, Resource)]
pub struct NodeLookup {
    forward: Vec<Option<Entity>>,
    reverse: HashMap<Entity, i64, EntityHash>,
}

impl NodeLookup {
    pub fn len(&self) -> usize {
        self.reverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, Entity)> + '_ {
        self.forward
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|e| (i as i64, e)))
    }

    pub fn insert(&mut self, bus_id: i64, entity: Entity) {
        let idx = bus_id as usize;
        if self.forward.len() <= idx {
            self.forward.resize_with(idx + 1, || None);
        }
        if let Some(old_id) = self.reverse.insert(entity, bus_id) {
            if let Some(e) = self.forward.get_mut(old_id as usize) {
                if *e == Some(entity) {
                    *e = None;
                }
            }
        }
        self.forward[idx] = Some(entity);
    }

    pub fn get_entity(&self, bus_id: i64) -> Option<Entity> {
        self.forward.get(bus_id as usize).and_then(|x| *x)
    }

    pub fn get_id(&self, entity: Entity) -> Option<i64> {
        self.reverse.get(&entity).copied()
    }

    pub fn contains_id(&self, bus_id: i64) -> bool {
        self.forward
            .get(bus_id as usize)
            .is_some_and(|e| e.is_some())
    }
}

/// Resource that maps branch/appliance/sensor identifiers to ECS entities.
#[derive(Default, Debug, Resource, Deref, DerefMut)]
pub struct ElemLookup(pub HashMap<i64, Entity>);

pub mod setup {
    use super::*;

    /// Builds the node lookup once all bus entities are spawned.
    pub fn init_node_lookup(mut cmd: Commands, bus_ids: Query<(Entity, &BusID)>) {
        let mut lookup = NodeLookup::default();
        bus_ids.iter().for_each(|(entity, bus_id)| {
            lookup.insert(bus_id.0, entity);
        });
        cmd.insert_resource(lookup);
    }

    /// Builds the element lookup over everything that carries a stable id.
    pub fn init_elem_lookup(mut cmd: Commands, ids: Query<(Entity, &ElemID)>) {
        let mut lookup = ElemLookup::default();
        ids.iter().for_each(|(entity, elem_id)| {
            lookup.insert(elem_id.0, entity);
        });
        cmd.insert_resource(lookup);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lookup_round_trip() {
        let mut world = World::new();
        let e1 = world.spawn(BusBundle {
            bus_id: BusID(0),
            ..Default::default()
        });
        let e1 = e1.id();
        let e2 = world
            .spawn(BusBundle {
                bus_id: BusID(3),
                ..Default::default()
            })
            .id();

        let mut lookup = NodeLookup::default();
        lookup.insert(0, e1);
        lookup.insert(3, e2);

        assert_eq!(lookup.len(), 2);
        assert_eq!(lookup.get_entity(3), Some(e2));
        assert_eq!(lookup.get_id(e1), Some(0));
        assert!(!lookup.contains_id(1));
    }

    #[test]
    fn test_node_lookup_reinsert_moves_id() {
        let mut world = World::new();
        let e = world.spawn_empty().id();
        let mut lookup = NodeLookup::default();
        lookup.insert(1, e);
        lookup.insert(5, e);
        assert!(!lookup.contains_id(1));
        assert_eq!(lookup.get_entity(5), Some(e));
        assert_eq!(lookup.len(), 1);
    }
}
