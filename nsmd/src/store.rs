//! Arena stores for endpoints and sensors.
//!
//! The object graph is cyclic by nature (aggregator ↔ child, sensor ↔
//! endpoint, dispatcher ↔ waiter), so nothing here holds a reference
//! to anything else: stores hand out dense ids and every
//! back-reference is an id dereferenced at the point of use. Stores
//! are built once at configuration time and frozen before the engine
//! starts.

use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::gate::EndpointGate;
use crate::sensor::SensorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorId(pub u32);

pub struct EndpointEntry {
    pub uuid: Uuid,
    pub gate: EndpointGate,
}

#[derive(Default)]
pub struct EndpointStore {
    entries: Vec<EndpointEntry>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, uuid: Uuid, eid_hint: u8) -> EndpointId {
        let id = EndpointId(self.entries.len() as u32);
        self.entries.push(EndpointEntry {
            uuid,
            gate: EndpointGate::new(eid_hint),
        });
        id
    }

    pub fn get(&self, id: EndpointId) -> &EndpointEntry {
        &self.entries[id.0 as usize]
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<EndpointId> {
        self.entries
            .iter()
            .position(|e| e.uuid == *uuid)
            .map(|i| EndpointId(i as u32))
    }

    pub fn ids(&self) -> impl Iterator<Item = EndpointId> + '_ {
        (0..self.entries.len()).map(|i| EndpointId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SensorMeta {
    pub name: String,
    pub endpoint: EndpointId,
    pub priority: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub long_running: bool,
}

pub struct SensorSlot {
    pub meta: SensorMeta,
    /// The sensor body. Only the owning endpoint's scheduling loop
    /// locks it, and long-running completions are delivered through
    /// that loop, so contention is nil by construction.
    pub body: AsyncMutex<SensorKind>,
}

#[derive(Default)]
pub struct SensorStore {
    entries: Vec<SensorSlot>,
}

impl SensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, meta: SensorMeta, body: SensorKind) -> SensorId {
        let id = SensorId(self.entries.len() as u32);
        self.entries.push(SensorSlot {
            meta,
            body: AsyncMutex::new(body),
        });
        id
    }

    pub fn get(&self, id: SensorId) -> &SensorSlot {
        &self.entries[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: SensorId) -> &mut SensorSlot {
        &mut self.entries[id.0 as usize]
    }

    /// Configuration-time priority migration: flips the flag before
    /// queues are derived from it.
    pub fn set_priority(&mut self, id: SensorId, priority: bool) {
        self.entries[id.0 as usize].meta.priority = priority;
    }

    pub fn ids_for_endpoint(&self, endpoint: EndpointId) -> Vec<SensorId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.meta.endpoint == endpoint)
            .map(|(i, _)| SensorId(i as u32))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
