//! Configuration loader: turns sensor records into store entries
//! through a registry of constructors keyed by kind name.
//!
//! Aggregate-flagged records do not become scheduled sensors; they
//! become children of the per-(endpoint, command) aggregator, which is
//! created on first use and inherits the highest priority of its
//! members.

use anyhow::Context;
use log::{info, warn};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::time::Duration;

use nsm_wire::telemetry::{self, InventoryProperty};

use crate::config::{Config, SensorConfig};
use crate::store::{EndpointId, EndpointStore, SensorMeta, SensorStore};

use super::{
    AggregateSensor, EnergySensor, InventorySensor, NumericReading, PortBandwidthSensor,
    PowerCapSensor, PowerDrawSensor, PresencePowerSensor, SensorKind, TemperatureSensor,
};

type Constructor = fn(&SensorConfig) -> anyhow::Result<SensorKind>;

fn binding(cfg: &SensorConfig) -> NumericReading {
    NumericReading::new(cfg.object_path.clone(), cfg.object_property.clone())
}

/// Kind name → constructor. Adding a sensor kind means adding an entry
/// here and an arm to `SensorKind`.
static CONSTRUCTORS: Lazy<HashMap<&'static str, Constructor>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, Constructor> = HashMap::new();
    map.insert("temperature", |cfg| {
        Ok(SensorKind::Temperature(TemperatureSensor {
            sensor_id: cfg.sensor_id,
            reading: binding(cfg),
        }))
    });
    map.insert("power", |cfg| {
        Ok(SensorKind::PowerDraw(PowerDrawSensor {
            sensor_id: cfg.sensor_id,
            averaging_interval: cfg.averaging_interval,
            reading: binding(cfg),
        }))
    });
    map.insert("energy", |cfg| {
        Ok(SensorKind::Energy(EnergySensor {
            sensor_id: cfg.sensor_id,
            reading: binding(cfg),
        }))
    });
    map.insert("port_bandwidth", |cfg| {
        Ok(SensorKind::PortBandwidth(PortBandwidthSensor {
            port_id: cfg.port_id,
            reading: binding(cfg),
        }))
    });
    map.insert("inventory", |cfg| {
        let name = cfg
            .property
            .as_deref()
            .context("inventory sensor needs a property")?;
        Ok(SensorKind::Inventory(InventorySensor {
            property: parse_property(name)?,
            reading: binding(cfg),
        }))
    });
    map.insert("power_cap", |cfg| {
        let limit_watts = cfg
            .power_limit_watts
            .context("power_cap sensor needs power_limit_watts")?;
        Ok(SensorKind::PowerCap(PowerCapSensor {
            limit_watts,
            reading: binding(cfg),
        }))
    });
    map.insert("presence_power", |cfg| {
        Ok(SensorKind::PresencePower(PresencePowerSensor::new(
            &cfg.object_path,
        )))
    });
    map
});

pub fn parse_property(name: &str) -> anyhow::Result<InventoryProperty> {
    let property = match name {
        "BoardPartNumber" => InventoryProperty::BoardPartNumber,
        "SerialNumber" => InventoryProperty::SerialNumber,
        "MarketingName" => InventoryProperty::MarketingName,
        "DevicePartNumber" => InventoryProperty::DevicePartNumber,
        "FruDeviceDescription" => InventoryProperty::FruDeviceDescription,
        "ProductLength" => InventoryProperty::ProductLength,
        "ProductWidth" => InventoryProperty::ProductWidth,
        "ProductHeight" => InventoryProperty::ProductHeight,
        "MinimumDevicePowerLimit" => InventoryProperty::MinimumDevicePowerLimit,
        "MaximumDevicePowerLimit" => InventoryProperty::MaximumDevicePowerLimit,
        "RatedModulePowerLimit" => InventoryProperty::RatedModulePowerLimit,
        "MemoryVendor" => InventoryProperty::MemoryVendor,
        "MemoryPartNumber" => InventoryProperty::MemoryPartNumber,
        "BuildDate" => InventoryProperty::BuildDate,
        "FirmwareVersion" => InventoryProperty::FirmwareVersion,
        "DeviceGuid" => InventoryProperty::DeviceGuid,
        other => anyhow::bail!("unknown inventory property {other:?}"),
    };
    Ok(property)
}

fn aggregate_command(kind: &str) -> anyhow::Result<u8> {
    match kind {
        "temperature" => Ok(telemetry::GET_TEMPERATURE_READING),
        "power" => Ok(telemetry::GET_CURRENT_POWER_DRAW),
        "energy" => Ok(telemetry::GET_CURRENT_ENERGY_COUNT),
        other => anyhow::bail!("kind {other:?} has no aggregate form"),
    }
}

pub struct BuiltStores {
    pub endpoints: EndpointStore,
    pub sensors: SensorStore,
    /// Sensor names whose endpoint UUID had no `[[endpoints]]` entry;
    /// their loops idle until discovery resolves the UUID.
    pub awaiting_discovery: Vec<String>,
}

/// Build the endpoint and sensor arenas from configuration. Endpoints
/// referenced only by sensors get an entry too - the invariant is that
/// a sensor's UUID resolves in the *registry*, and its loop waits for
/// that.
pub fn build_stores(config: &Config) -> anyhow::Result<BuiltStores> {
    let mut endpoints = EndpointStore::new();
    for entry in &config.endpoints {
        if endpoints.find_by_uuid(&entry.uuid).is_some() {
            warn!("[config] duplicate endpoint entry for {}", entry.uuid);
            continue;
        }
        endpoints.insert(entry.uuid, entry.eid);
    }

    let mut awaiting_discovery = Vec::new();
    let default_interval = config.polling.default_interval();
    let timeout = config.polling.request_timeout();

    // Aggregators assemble outside the store so children can be added
    // freely, then everything is inserted at the end.
    let mut plain: Vec<(SensorMeta, SensorKind)> = Vec::new();
    let mut aggregators: HashMap<(EndpointId, u8), (SensorMeta, AggregateSensor)> =
        HashMap::new();

    for sensor in &config.sensors {
        let endpoint = match endpoints.find_by_uuid(&sensor.uuid) {
            Some(endpoint) => endpoint,
            None => {
                // Deferred: the UUID is not in the endpoint table yet.
                awaiting_discovery.push(sensor.name.clone());
                endpoints.insert(sensor.uuid, 0)
            }
        };
        let interval = sensor
            .interval_ms
            .map(Duration::from_millis)
            .unwrap_or(default_interval);

        if sensor.aggregate {
            let command = aggregate_command(&sensor.kind)
                .with_context(|| format!("sensor {}", sensor.name))?;
            let entry = aggregators.entry((endpoint, command)).or_insert_with(|| {
                let name = format!("{}_aggregate", sensor.kind);
                info!("[config] creating aggregator {name} for {}", sensor.uuid);
                (
                    SensorMeta {
                        name: name.clone(),
                        endpoint,
                        priority: false,
                        interval,
                        timeout,
                        long_running: false,
                    },
                    AggregateSensor::new(name, command, sensor.averaging_interval),
                )
            });
            // The aggregator inherits the highest priority and the
            // shortest interval of its members.
            if sensor.priority && !entry.0.priority {
                entry.0.priority = true;
            }
            if interval < entry.0.interval {
                entry.0.interval = interval;
            }
            entry
                .1
                .add_child(sensor.sensor_id, binding(sensor))
                .with_context(|| format!("sensor {}", sensor.name))?;
        } else {
            let constructor = CONSTRUCTORS
                .get(sensor.kind.as_str())
                .with_context(|| format!("unknown sensor kind {:?}", sensor.kind))?;
            let body = constructor(sensor).with_context(|| format!("sensor {}", sensor.name))?;
            plain.push((
                SensorMeta {
                    name: sensor.name.clone(),
                    endpoint,
                    priority: sensor.priority,
                    interval,
                    timeout,
                    long_running: sensor.long_running,
                },
                body,
            ));
        }
    }

    let mut sensors = SensorStore::new();
    for (meta, body) in plain {
        sensors.insert(meta, body);
    }
    for (_, (meta, aggregator)) in aggregators {
        sensors.insert(meta, SensorKind::Aggregate(aggregator));
    }

    info!(
        "[config] built {} endpoints, {} scheduled sensors",
        endpoints.len(),
        sensors.len()
    );
    Ok(BuiltStores {
        endpoints,
        sensors,
        awaiting_discovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(toml: &str) -> Config {
        toml::from_str(toml).unwrap()
    }

    const UUID_A: &str = "c0fef542-1e25-47ea-b46c-3e1f3a0a3a2a";

    #[test]
    fn builds_plain_sensors() {
        let cfg = config(&format!(
            r#"
[[endpoints]]
eid = 30
uuid = "{UUID_A}"

[[sensors]]
name = "gpu0_temp"
kind = "temperature"
uuid = "{UUID_A}"
sensor_id = 2
object_path = "/sensors/gpu0_temp"

[[sensors]]
name = "gpu0_cap"
kind = "power_cap"
uuid = "{UUID_A}"
long_running = true
power_limit_watts = 450.0
object_path = "/control/gpu0_cap"
"#
        ));
        let built = build_stores(&cfg).unwrap();
        assert_eq!(built.endpoints.len(), 1);
        assert_eq!(built.sensors.len(), 2);
        assert!(built.awaiting_discovery.is_empty());
        let meta = &built.sensors.get(crate::store::SensorId(1)).meta;
        assert!(meta.long_running);
        assert_eq!(meta.interval, Duration::from_millis(500));
    }

    #[test]
    fn aggregate_members_fold_into_one_aggregator() {
        let cfg = config(&format!(
            r#"
[[endpoints]]
eid = 30
uuid = "{UUID_A}"

[[sensors]]
name = "gpu0_power"
kind = "power"
uuid = "{UUID_A}"
aggregate = true
sensor_id = 0
object_path = "/sensors/gpu0_power"

[[sensors]]
name = "gpu1_power"
kind = "power"
uuid = "{UUID_A}"
aggregate = true
priority = true
sensor_id = 1
interval_ms = 200
object_path = "/sensors/gpu1_power"
"#
        ));
        let built = build_stores(&cfg).unwrap();
        // Two records, one scheduled aggregator.
        assert_eq!(built.sensors.len(), 1);
        let slot = built.sensors.get(crate::store::SensorId(0));
        assert_eq!(slot.meta.name, "power_aggregate");
        // Inherited from the priority member.
        assert!(slot.meta.priority);
        assert_eq!(slot.meta.interval, Duration::from_millis(200));
        match &*slot.body.try_lock().unwrap() {
            SensorKind::Aggregate(agg) => assert_eq!(agg.child_count(), 2),
            _ => panic!("expected aggregator"),
        }
    }

    #[test]
    fn duplicate_aggregate_tag_is_a_config_error() {
        let cfg = config(&format!(
            r#"
[[endpoints]]
eid = 30
uuid = "{UUID_A}"

[[sensors]]
name = "a"
kind = "power"
uuid = "{UUID_A}"
aggregate = true
sensor_id = 3
object_path = "/a"

[[sensors]]
name = "b"
kind = "power"
uuid = "{UUID_A}"
aggregate = true
sensor_id = 3
object_path = "/b"
"#
        ));
        assert!(build_stores(&cfg).is_err());
    }

    #[test]
    fn unknown_kind_is_a_config_error() {
        let cfg = config(&format!(
            r#"
[[sensors]]
name = "x"
kind = "frobnicator"
uuid = "{UUID_A}"
object_path = "/x"
"#
        ));
        assert!(build_stores(&cfg).is_err());
    }

    #[test]
    fn sensor_without_endpoint_entry_waits_for_discovery() {
        let cfg = config(&format!(
            r#"
[[sensors]]
name = "orphan"
kind = "temperature"
uuid = "{UUID_A}"
object_path = "/orphan"
"#
        ));
        let built = build_stores(&cfg).unwrap();
        assert_eq!(built.awaiting_discovery, vec!["orphan".to_string()]);
        // The endpoint entry exists so the loop can wait on the
        // registry.
        assert_eq!(built.endpoints.len(), 1);
    }

    #[test]
    fn inventory_property_names_parse() {
        assert!(parse_property("BoardPartNumber").is_ok());
        assert!(parse_property("RatedModulePowerLimit").is_ok());
        assert!(parse_property("FlyWheelDiameter").is_err());
    }
}
