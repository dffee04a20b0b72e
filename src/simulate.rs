use std::env;

use crate::config::{Credentials, TankConfig};
use crate::net::{LinkError, NetworkLink};
use crate::node::RangeSensor;
use crate::tank::MAX_PING_DISTANCE;

/// Chance that a single ping returns an echo from outside the tank.
const NOISE_RATE: f32 = 0.02;

/// Sonar stand-in: each tank's surface drifts slowly between empty and full.
pub struct SimulatedSonar {
    distances: Vec<f32>,
    bounds: Vec<(f32, f32)>,
}

impl SimulatedSonar {
    pub fn new(tanks: &[TankConfig]) -> Self {
        let bounds: Vec<(f32, f32)> = tanks
            .iter()
            .map(|t| (t.sensor_offset, t.sensor_offset + t.depth))
            .collect();
        let distances = bounds
            .iter()
            .map(|(near, far)| near + (far - near) * rand::random::<f32>())
            .collect();
        Self { distances, bounds }
    }
}

impl RangeSensor for SimulatedSonar {
    fn ping_cm(&mut self, tank: usize) -> Option<f32> {
        let (near, far) = *self.bounds.get(tank)?;
        if rand::random::<f32>() < NOISE_RATE {
            return Some(MAX_PING_DISTANCE + 100.0 * rand::random::<f32>());
        }
        let distance = self.distances.get_mut(tank)?;
        *distance = (*distance + rand::random::<f32>() - 0.5).clamp(near, far);
        Some(*distance)
    }
}

/// Wireless link stand-in for running a node on a host.
pub struct SimulatedLink {
    /// SSIDs in range; `None` means every SSID associates.
    reachable: Option<Vec<String>>,
    failure_rate: f64,
    up: bool,
}

impl SimulatedLink {
    pub fn new(reachable: Option<Vec<String>>, failure_rate: f64) -> Self {
        Self {
            reachable,
            failure_rate: failure_rate.clamp(0.0, 1.0),
            up: false,
        }
    }

    /// `TANKMON_SIM_SSIDS` (comma separated) and `TANKMON_SIM_LINK_FAILURE_RATE`.
    pub fn from_env() -> Self {
        let reachable = env::var("TANKMON_SIM_SSIDS").ok().map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });
        let failure_rate = env::var("TANKMON_SIM_LINK_FAILURE_RATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0);
        Self::new(reachable, failure_rate)
    }

    pub fn drop_link(&mut self) {
        self.up = false;
    }
}

impl NetworkLink for SimulatedLink {
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), LinkError> {
        let in_range = self
            .reachable
            .as_ref()
            .map_or(true, |list| list.contains(&credentials.ssid));
        if !in_range {
            return Err(LinkError::Unreachable {
                ssid: credentials.ssid.clone(),
            });
        }
        if rand::random::<f64>() < self.failure_rate {
            return Err(LinkError::Rejected {
                ssid: credentials.ssid.clone(),
                reason: "simulated association failure".to_string(),
            });
        }
        self.up = true;
        log::info!("Simulated link up on {}", credentials.ssid);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.up
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tank::tests::tank_config;

    #[tokio::test]
    async fn test_link_respects_reachable_list() {
        let mut link = SimulatedLink::new(Some(vec!["backup".to_string()]), 0.0);
        let primary = Credentials {
            ssid: "primary".to_string(),
            password: String::new(),
        };
        assert!(link.connect(&primary).await.is_err());
        let backup = Credentials {
            ssid: "backup".to_string(),
            password: String::new(),
        };
        assert!(link.connect(&backup).await.is_ok());
        assert!(link.is_connected());
        link.drop_link();
        assert!(!link.is_connected());
    }

    #[test]
    fn test_sonar_stays_plausible() {
        let tanks = vec![tank_config(95.25, 10.8, 0.1, 1.1)];
        let mut sonar = SimulatedSonar::new(&tanks);
        for _ in 0..200 {
            let d = sonar.ping_cm(0).unwrap();
            assert!(d >= 21.0);
        }
        assert!(sonar.ping_cm(1).is_none());
    }
}
