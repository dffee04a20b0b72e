//! tankmon: liquid level monitoring for a small set of sonar-gauged tanks.
//!
//! Loads a site configuration at boot, seeds tank levels from the last
//! persisted snapshot, turns sonar pings into levels, volumes and alarms, and
//! reports them to an MQTT broker while riding out WiFi and broker outages.

pub mod alarm;
pub mod config;
pub mod connectivity;
pub mod net;
pub mod node;
pub mod simulate;
pub mod storage;
pub mod tank;
pub mod timesync;
pub mod types;
