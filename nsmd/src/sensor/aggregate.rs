//! The aggregator: a sensor whose command returns the tagged sample
//! container and whose decode fans samples out to child readings by
//! tag. Children are output bindings, not scheduled sensors - the
//! aggregator's single round-trip feeds all of them.

use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;

use nsm_wire::aggregate::{self, TAG_MAX_CHILD, TAG_TIMESTAMP, TAG_UUID};
use nsm_wire::msg::{MessageType, WireError};
use nsm_wire::telemetry;

use crate::sinks::{SinkList, SinkValue};

use super::{NumericReading, Sensor, SensorAction, SensorError};

/// Per-command sample interpretation. Matches the scalar decode of the
/// same command so a value takes one conversion path regardless of
/// how it travelled.
fn decode_sample_value(command: u8, data: &[u8]) -> Result<f64, WireError> {
    match command {
        telemetry::GET_TEMPERATURE_READING => telemetry::temperature_from_sample(data),
        telemetry::GET_CURRENT_POWER_DRAW => telemetry::power_from_sample(data),
        telemetry::GET_CURRENT_ENERGY_COUNT => telemetry::energy_from_sample(data),
        _ => Err(WireError::InvalidData),
    }
}

pub struct AggregateSensor {
    pub name: String,
    command: u8,
    averaging_interval: u8,
    children: HashMap<u8, NumericReading>,
    /// Reserved-tag scratch fields: refreshed by 0xFE/0xFF samples,
    /// never delivered to children.
    pub scratch_uuid: Option<[u8; 16]>,
    pub scratch_timestamp: Option<u64>,
}

impl AggregateSensor {
    pub fn new(name: impl Into<String>, command: u8, averaging_interval: u8) -> Self {
        Self {
            name: name.into(),
            command,
            averaging_interval,
            children: HashMap::new(),
            scratch_uuid: None,
            scratch_timestamp: None,
        }
    }

    /// Register a child on a tag. Reserved and duplicate tags fail,
    /// which makes double-binding a configuration error rather than a
    /// silent overwrite.
    pub fn add_child(&mut self, tag: u8, reading: NumericReading) -> anyhow::Result<()> {
        if tag > TAG_MAX_CHILD {
            anyhow::bail!("tag {tag:#04x} is reserved");
        }
        if self.children.contains_key(&tag) {
            anyhow::bail!("tag {tag:#04x} already bound in aggregator {}", self.name);
        }
        self.children.insert(tag, reading);
        Ok(())
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

#[async_trait]
impl Sensor for AggregateSensor {
    fn correlation(&self) -> (MessageType, u8) {
        (MessageType::Telemetry, self.command)
    }

    fn make_request(&mut self) -> Result<Vec<u8>, SensorError> {
        let frame = match self.command {
            telemetry::GET_TEMPERATURE_READING => {
                telemetry::encode_temperature_req(telemetry::AGGREGATE_SENSOR_ID)
            }
            telemetry::GET_CURRENT_POWER_DRAW => telemetry::encode_power_draw_req(
                telemetry::AGGREGATE_SENSOR_ID,
                self.averaging_interval,
            ),
            telemetry::GET_CURRENT_ENERGY_COUNT => {
                telemetry::encode_energy_count_req(telemetry::AGGREGATE_SENSOR_ID)
            }
            _ => Err(WireError::InvalidData),
        };
        frame.map_err(SensorError::Encode)
    }

    async fn handle_response(
        &mut self,
        frame: &[u8],
        sinks: &SinkList,
    ) -> Result<SensorAction, SensorError> {
        let resp = aggregate::decode_aggregate_response(frame).map_err(SensorError::Decode)?;
        if !resp.completion.is_success() {
            return Err(SensorError::Refused {
                completion: resp.completion,
                reason: resp.reason,
            });
        }

        for sample in resp.samples() {
            let sample = sample.map_err(SensorError::Decode)?;
            match sample.tag {
                TAG_TIMESTAMP => match aggregate::timestamp_from_sample(sample.data) {
                    Ok(ts) => self.scratch_timestamp = Some(ts),
                    Err(e) => warn!(
                        "[aggregate] {} bad timestamp sample: {e}",
                        self.name
                    ),
                },
                TAG_UUID => match aggregate::uuid_from_sample(sample.data) {
                    Ok(uuid) => self.scratch_uuid = Some(uuid),
                    Err(e) => warn!("[aggregate] {} bad uuid sample: {e}", self.name),
                },
                tag => {
                    let Some(child) = self.children.get(&tag) else {
                        warn!(
                            "[aggregate] {} sample for unbound tag {tag:#04x}",
                            self.name
                        );
                        continue;
                    };
                    if !sample.valid {
                        // Invalid samples leave the child's last
                        // reading untouched.
                        debug!(
                            "[aggregate] {} tag {tag:#04x} sample marked invalid",
                            self.name
                        );
                        continue;
                    }
                    match decode_sample_value(self.command, sample.data) {
                        Ok(value) => {
                            child
                                .update(sinks, SinkValue::Number(value), self.scratch_timestamp)
                                .await;
                        }
                        Err(e) => {
                            warn!(
                                "[aggregate] {} tag {tag:#04x} sample decode failed: {e}",
                                self.name
                            );
                        }
                    }
                }
            }
        }
        Ok(SensorAction::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::{JsonlSink, SinkList};
    use nsm_wire::msg::CompletionCode;

    fn power_aggregator_with_children(tags: &[u8]) -> AggregateSensor {
        let mut agg = AggregateSensor::new("power", telemetry::GET_CURRENT_POWER_DRAW, 0);
        for tag in tags {
            agg.add_child(
                *tag,
                NumericReading::new(format!("/inventory/gpu{tag}/power"), "Value"),
            )
            .unwrap();
        }
        agg
    }

    #[test]
    fn duplicate_and_reserved_tags_fail_registration() {
        let mut agg = power_aggregator_with_children(&[0]);
        assert!(agg.add_child(0, NumericReading::new("/p", "Value")).is_err());
        assert!(agg
            .add_child(TAG_UUID, NumericReading::new("/p", "Value"))
            .is_err());
        assert!(agg
            .add_child(TAG_TIMESTAMP, NumericReading::new("/p", "Value"))
            .is_err());
        assert_eq!(agg.child_count(), 1);
    }

    async fn collect_readings(agg: &mut AggregateSensor, frame: &[u8]) -> Vec<serde_json::Value> {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sinks = SinkList::new();
        sinks.register(JsonlSink::new(file.path().to_str().unwrap()).await.unwrap());
        agg.handle_response(frame, &sinks).await.unwrap();
        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn samples_fan_out_to_children_by_tag() {
        let mut agg = power_aggregator_with_children(&[0, 1, 2]);
        let ts = 1_234_567u64.to_le_bytes();
        let (p0, p1, p2) = (
            10_000u32.to_le_bytes(),
            20_000u32.to_le_bytes(),
            30_000u32.to_le_bytes(),
        );
        let samples: Vec<(u8, bool, &[u8])> = vec![
            (0xFF, true, &ts),
            (0, true, &p0),
            (1, true, &p1),
            (2, true, &p2),
        ];
        let frame = aggregate::encode_aggregate_response(
            0,
            MessageType::Telemetry,
            telemetry::GET_CURRENT_POWER_DRAW,
            &samples,
        )
        .unwrap();

        let lines = collect_readings(&mut agg, &frame).await;
        assert_eq!(agg.scratch_timestamp, Some(1_234_567));
        // One reading plus one status line per child.
        let readings: Vec<_> = lines.iter().filter(|l| l.get("value").is_some()).collect();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0]["value"], 10.0);
        assert_eq!(readings[0]["object_path"], "/inventory/gpu0/power");
        assert_eq!(readings[0]["timestamp_ms"], 1_234_567);
        assert_eq!(readings[2]["value"], 30.0);
    }

    #[tokio::test]
    async fn invalid_sample_does_not_update_its_child() {
        let mut agg = power_aggregator_with_children(&[0, 1]);
        let p0 = 10_000u32.to_le_bytes();
        let samples: Vec<(u8, bool, &[u8])> =
            vec![(0, true, &p0), (1, false, &[0u8; 4])];
        let frame = aggregate::encode_aggregate_response(
            0,
            MessageType::Telemetry,
            telemetry::GET_CURRENT_POWER_DRAW,
            &samples,
        )
        .unwrap();

        let lines = collect_readings(&mut agg, &frame).await;
        let readings: Vec<_> = lines.iter().filter(|l| l.get("value").is_some()).collect();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0]["object_path"], "/inventory/gpu0/power");
    }

    #[tokio::test]
    async fn reserved_tags_update_scratch_only() {
        let mut agg = power_aggregator_with_children(&[0]);
        let uuid = [9u8; 16];
        let ts = 42u64.to_le_bytes();
        let samples: Vec<(u8, bool, &[u8])> =
            vec![(TAG_UUID, true, &uuid), (TAG_TIMESTAMP, true, &ts)];
        let frame = aggregate::encode_aggregate_response(
            0,
            MessageType::Telemetry,
            telemetry::GET_CURRENT_POWER_DRAW,
            &samples,
        )
        .unwrap();

        let lines = collect_readings(&mut agg, &frame).await;
        assert!(lines.is_empty());
        assert_eq!(agg.scratch_uuid, Some(uuid));
        assert_eq!(agg.scratch_timestamp, Some(42));
    }

    #[tokio::test]
    async fn refused_aggregate_is_an_error() {
        let mut agg = power_aggregator_with_children(&[0]);
        let frame = nsm_wire::msg::encode_refusal(
            0,
            MessageType::Telemetry,
            telemetry::GET_CURRENT_POWER_DRAW,
            CompletionCode::Unavailable,
            3,
        );
        let err = agg
            .handle_response(&frame, &SinkList::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SensorError::Refused {
                completion: CompletionCode::Unavailable,
                reason: 3
            }
        );
    }
}
