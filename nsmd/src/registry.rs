//! The endpoint registry: which endpoint id reaches which device.
//!
//! Devices are identified by a stable 16 byte UUID; the endpoint id an
//! MCTP path assigns to them can change across a rediscovery. The
//! registry is a multi-map because a device can be reachable over more
//! than one medium; one route per UUID is marked preferred.
//!
//! Discovery is the only writer. The engine reads between sensor
//! operations, never in the middle of a request, so a plain RwLock
//! with no await under it is all the synchronisation this needs.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediumClass {
    Pcie,
    Spi,
    I2c,
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub eid: u8,
    pub medium: MediumClass,
    pub preferred: bool,
}

#[derive(Default)]
struct RegistryInner {
    by_uuid: HashMap<Uuid, Vec<RouteEntry>>,
    by_eid: HashMap<u8, Uuid>,
}

#[derive(Default)]
pub struct EndpointRegistry {
    inner: RwLock<RegistryInner>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a route. The first route recorded for a UUID
    /// becomes the preferred one; re-registering an existing medium
    /// updates its endpoint id in place (the rediscovery case).
    pub fn upsert(&self, uuid: Uuid, eid: u8, medium: MediumClass) {
        let mut inner = self.inner.write().unwrap();
        let routes = inner.by_uuid.entry(uuid).or_default();
        if let Some(existing) = routes.iter_mut().find(|r| r.medium == medium) {
            let old_eid = existing.eid;
            existing.eid = eid;
            if old_eid != eid {
                inner.by_eid.remove(&old_eid);
            }
        } else {
            let preferred = routes.is_empty();
            routes.push(RouteEntry {
                eid,
                medium,
                preferred,
            });
        }
        inner.by_eid.insert(eid, uuid);
    }

    /// Endpoint id of the preferred route, if any.
    pub fn preferred_eid(&self, uuid: &Uuid) -> Option<u8> {
        let inner = self.inner.read().unwrap();
        let routes = inner.by_uuid.get(uuid)?;
        routes
            .iter()
            .find(|r| r.preferred)
            .or_else(|| routes.first())
            .map(|r| r.eid)
    }

    pub fn uuid_for_eid(&self, eid: u8) -> Option<Uuid> {
        self.inner.read().unwrap().by_eid.get(&eid).copied()
    }

    pub fn routes(&self, uuid: &Uuid) -> Vec<RouteEntry> {
        self.inner
            .read()
            .unwrap()
            .by_uuid
            .get(uuid)
            .cloned()
            .unwrap_or_default()
    }

    /// Offline transition: drop the endpoint-id index entry. The UUID
    /// and its routes stay so the engine can keep pinging the last
    /// known id.
    pub fn clear_eid(&self, eid: u8) {
        self.inner.write().unwrap().by_eid.remove(&eid);
    }

    /// Online transition: restore the reverse index for a route that
    /// answered a ping again.
    pub fn restore_eid(&self, uuid: Uuid, eid: u8) {
        let mut inner = self.inner.write().unwrap();
        if inner
            .by_uuid
            .get(&uuid)
            .is_some_and(|routes| routes.iter().any(|r| r.eid == eid))
        {
            inner.by_eid.insert(eid, uuid);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        Uuid::from_bytes([n; 16])
    }

    #[test]
    fn first_route_is_preferred() {
        let registry = EndpointRegistry::new();
        registry.upsert(uuid(1), 30, MediumClass::Pcie);
        registry.upsert(uuid(1), 31, MediumClass::I2c);
        assert_eq!(registry.preferred_eid(&uuid(1)), Some(30));
        let routes = registry.routes(&uuid(1));
        assert_eq!(routes.len(), 2);
        assert!(routes[0].preferred);
        assert!(!routes[1].preferred);
        assert_eq!(registry.uuid_for_eid(31), Some(uuid(1)));
    }

    #[test]
    fn rediscovery_moves_the_eid() {
        let registry = EndpointRegistry::new();
        registry.upsert(uuid(1), 30, MediumClass::Pcie);
        // Same medium, new endpoint id after the device re-enumerated.
        registry.upsert(uuid(1), 42, MediumClass::Pcie);
        assert_eq!(registry.preferred_eid(&uuid(1)), Some(42));
        assert_eq!(registry.uuid_for_eid(42), Some(uuid(1)));
        assert_eq!(registry.uuid_for_eid(30), None);
        assert_eq!(registry.routes(&uuid(1)).len(), 1);
    }

    #[test]
    fn offline_clears_only_the_eid_index() {
        let registry = EndpointRegistry::new();
        registry.upsert(uuid(1), 30, MediumClass::Pcie);
        registry.clear_eid(30);
        assert_eq!(registry.uuid_for_eid(30), None);
        // Routes survive so the engine can keep pinging.
        assert_eq!(registry.preferred_eid(&uuid(1)), Some(30));

        registry.restore_eid(uuid(1), 30);
        assert_eq!(registry.uuid_for_eid(30), Some(uuid(1)));
    }

    #[test]
    fn restore_ignores_unknown_routes() {
        let registry = EndpointRegistry::new();
        registry.upsert(uuid(1), 30, MediumClass::Pcie);
        registry.restore_eid(uuid(1), 99);
        assert_eq!(registry.uuid_for_eid(99), None);
    }
}
