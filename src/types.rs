use serde::{Deserialize, Serialize};

use crate::tank::Tank;

pub const CVT_FACTOR_GALLONS: f32 = 0.26417;
pub const CVT_FACTOR_INCHES: f32 = 0.39370;

/// Per-tank report published on the data topic. Keys are kept short for
/// the broker's payload limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TankReport {
    #[serde(rename = "n")]
    pub node: String,
    #[serde(rename = "t")]
    pub tank: u32,
    #[serde(rename = "tT")]
    pub tank_type: String,
    #[serde(rename = "d")]
    pub depth: f32,
    #[serde(rename = "vCM")]
    pub vcm: f32,
    #[serde(rename = "lD")]
    pub liquid_depth: f32,
    #[serde(rename = "lDAvg")]
    pub liquid_depth_avg: f32,
    #[serde(rename = "lV")]
    pub liquid_volume: f32,
    #[serde(rename = "lvAvg")]
    pub liquid_volume_avg: f32,
    #[serde(rename = "pF")]
    pub percent_full: f32,
    #[serde(rename = "sO")]
    pub sensor_offset: f32,
    #[serde(rename = "loA")]
    pub lo_alarm: f32,
    #[serde(rename = "hiA")]
    pub hi_alarm: f32,
    #[serde(rename = "aF")]
    pub alarm_flags: u8,
    #[serde(rename = "ts", default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TankReport {
    pub fn new(node: &str, tank_number: u32, tank: &Tank, imperial: bool, timestamp: Option<String>) -> Self {
        let (len, vol) = if imperial {
            (CVT_FACTOR_INCHES, CVT_FACTOR_GALLONS)
        } else {
            (1.0, 1.0)
        };
        let cfg = &tank.config;
        let s = &tank.state;
        TankReport {
            node: node.to_string(),
            tank: tank_number,
            tank_type: cfg.kind.as_tag().to_string(),
            depth: cfg.depth * len,
            vcm: cfg.vcm * vol / len,
            liquid_depth: s.liquid_depth * len,
            liquid_depth_avg: s.liquid_depth_avg * len,
            liquid_volume: s.liquid_volume * vol,
            liquid_volume_avg: s.liquid_volume_avg * vol,
            percent_full: s.percent_full,
            sensor_offset: cfg.sensor_offset * len,
            lo_alarm: cfg.lo_alarm * len,
            hi_alarm: cfg.hi_alarm * len,
            alarm_flags: s.alarms.current.bits(),
            timestamp,
        }
    }

    /// Liquid depth in centimeters, undoing the imperial conversion.
    pub fn liquid_depth_cm(&self, imperial: bool) -> f32 {
        if imperial {
            self.liquid_depth / CVT_FACTOR_INCHES
        } else {
            self.liquid_depth
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutoffReason {
    LowWater,
    Inactive,
}

/// Asks a pump node to stop a pump fed by a low or silent tank.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShutoffRequest {
    #[serde(rename = "pumpnode")]
    pub pump_node: i64,
    #[serde(rename = "pumpnumber")]
    pub pump_number: u32,
    #[serde(rename = "t")]
    pub tank: u32,
    pub reason: ShutoffReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tank::tests::tank_config;
    use crate::tank::TankRegistry;
    use std::time::Instant;

    fn report(imperial: bool) -> TankReport {
        let now = Instant::now();
        let mut reg = TankRegistry::new(vec![tank_config(95.25, 10.8, 0.10, 1.10)], 2, 1, now);
        reg.apply_level(0, 5.0, now).unwrap();
        TankReport::new("node-a", reg.tank_number(0), reg.get(0).unwrap(), imperial, None)
    }

    #[test]
    fn test_wire_keys() {
        let value: serde_json::Value = serde_json::from_slice(&report(false).encode().unwrap()).unwrap();
        for key in ["n", "t", "tT", "d", "vCM", "lD", "lDAvg", "lV", "lvAvg", "pF", "sO", "loA", "hiA", "aF"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert!(value.get("ts").is_none());
        assert_eq!(value["t"], 2);
        assert_eq!(value["aF"], 2);
        assert_eq!(value["tT"], "W");
    }

    #[test]
    fn test_imperial_conversion() {
        let metric = report(false);
        let imperial = report(true);
        assert!((imperial.depth - metric.depth * CVT_FACTOR_INCHES).abs() < 1e-3);
        assert!((imperial.liquid_volume - metric.liquid_volume * CVT_FACTOR_GALLONS).abs() < 1e-3);
        assert!((imperial.liquid_depth_cm(true) - 5.0).abs() < 1e-3);
        assert_eq!(imperial.alarm_flags, metric.alarm_flags);
    }

    #[test]
    fn test_decode_remote_report() {
        let payload = br#"{"n":"propane","t":1,"tT":"P","d":95.5,"vCM":10.8,"lD":40.0,
            "lDAvg":40.0,"lV":432.0,"lvAvg":432.0,"pF":41.0,"sO":19,"loA":19.1,
            "hiA":85.95,"aF":0,"ts":"2020-12-8 08:01:01"}"#;
        let report = TankReport::decode(payload).unwrap();
        assert_eq!(report.tank, 1);
        assert_eq!(report.liquid_depth_cm(false), 40.0);
        assert_eq!(report.timestamp.as_deref(), Some("2020-12-8 08:01:01"));
        assert!(TankReport::decode(b"{\"t\":1}").is_err());
    }
}
