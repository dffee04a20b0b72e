//! The node's single control loop: ping tanks, persist, report, keep the
//! network up and the clock synced.

use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::{SiteConfig, TankConfig};
use crate::connectivity::{ConnectivitySupervisor, SessionPolicy, Supervision};
use crate::net::{BrokerSession, InboundMessage, NetworkLink};
use crate::storage::PersistStore;
use crate::tank::{SampleOutcome, TankRegistry};
use crate::timesync::{TimeSettings, TimeSource, TimeTransport, NTP_RETRY_COUNT, NTP_WAIT};
use crate::types::TankReport;

/// Distance sensor attached to each tank.
pub trait RangeSensor {
    /// One ping for the tank at `tank`; `None` when there was no echo.
    fn ping_cm(&mut self, tank: usize) -> Option<f32>;
}

/// Why [`Node::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    RestartRequested,
}

pub struct Node<L, S, T, R> {
    site: SiteConfig,
    registry: TankRegistry,
    persist: PersistStore,
    supervisor: ConnectivitySupervisor,
    link: L,
    session: S,
    time: TimeSource<T>,
    sensor: R,
    next_tank: usize,
}

impl<L, S, T, R> Node<L, S, T, R>
where
    L: NetworkLink,
    S: BrokerSession,
    T: TimeTransport,
    R: RangeSensor,
{
    /// Builds tank state from the loaded config, then seeds it from the
    /// persist record before any sample can land.
    pub fn boot(
        site: SiteConfig,
        tanks: Vec<TankConfig>,
        persist: PersistStore,
        link: L,
        session: S,
        time_transport: T,
        sensor: R,
    ) -> Self {
        let window = if site.use_avg { site.avg_window } else { 1 };
        let mut registry = TankRegistry::new(tanks, site.starting_tank, window, Instant::now());
        if let Some(levels) = persist.load() {
            if let Err(e) = registry.seed_levels(&levels) {
                warn!(error = %e, "persist record does not match tank table, starting from zero");
            }
        }

        let supervisor = ConnectivitySupervisor::new(
            site.primary.clone(),
            site.alternate.clone(),
            site.wifi_retry,
            SessionPolicy {
                retry: site.mqtt_retry,
                control_topic: Some(site.broker.control_topic.clone()),
            },
        );
        let time = TimeSource::new(
            time_transport,
            TimeSettings {
                server: site.ntp_server.clone(),
                timezone: site.timezone,
                dst: site.dst,
                sync_interval: site.ntp_sync_interval,
                retries: NTP_RETRY_COUNT,
                wait: NTP_WAIT,
            },
        );

        Self {
            site,
            registry,
            persist,
            supervisor,
            link,
            session,
            time,
            sensor,
            next_tank: 0,
        }
    }

    pub fn registry(&self) -> &TankRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &ConnectivitySupervisor {
        &self.supervisor
    }

    pub fn time_source(&self) -> &TimeSource<T> {
        &self.time
    }

    /// Link first, then the broker session. A fresh link also rebinds the
    /// time-sync listener.
    pub async fn ensure_connected(&mut self) -> Supervision {
        let link = self.supervisor.ensure_link(&mut self.link).await;
        match link {
            Supervision::RestartRequested => return link,
            Supervision::Reconnected => self.time.reset_listener(),
            Supervision::AlreadyConnected => {}
        }
        self.supervisor.ensure_session(&mut self.session).await
    }

    /// Pings the next tank in round-robin order.
    pub fn poll_next_tank(&mut self, now: Instant) -> SampleOutcome {
        if self.registry.is_empty() {
            return SampleOutcome::Discarded;
        }
        let index = self.next_tank;
        self.next_tank = (self.next_tank + 1) % self.registry.len();

        let outcome = match self.sensor.ping_cm(index) {
            Some(distance) => self.registry.apply_distance(index, distance, now),
            None => {
                debug!(tank = index, "no echo");
                Ok(SampleOutcome::Discarded)
            }
        };
        match outcome {
            Ok(outcome) => {
                if outcome.is_accepted() {
                    self.save_levels();
                }
                outcome
            }
            Err(e) => {
                error!(error = %e, "ping for unknown tank");
                SampleOutcome::Discarded
            }
        }
    }

    /// Applies a tank report relayed from another node on the control topic.
    pub fn handle_inbound(&mut self, msg: &InboundMessage, now: Instant) -> SampleOutcome {
        if msg.topic != self.site.broker.control_topic {
            debug!(topic = %msg.topic, "ignoring message on unexpected topic");
            return SampleOutcome::Discarded;
        }
        let report = match TankReport::decode(&msg.payload) {
            Ok(report) => report,
            Err(e) => {
                debug!(error = %e, "control message is not a tank report");
                return SampleOutcome::Discarded;
            }
        };
        let Some(index) = self.registry.local_index(report.tank) else {
            debug!(tank = report.tank, "report for a tank this node does not track");
            return SampleOutcome::Discarded;
        };

        let level = report.liquid_depth_cm(self.site.imperial);
        match self.registry.apply_level(index, level, now) {
            Ok(outcome) => {
                if outcome.is_accepted() {
                    info!(tank = report.tank, from = %report.node, level, "applied relayed level");
                    self.save_levels();
                }
                outcome
            }
            Err(e) => {
                error!(error = %e, "relayed level rejected");
                SampleOutcome::Discarded
            }
        }
    }

    fn save_levels(&self) {
        if let Err(e) = self.persist.save(&self.registry.levels()) {
            error!(error = %e, "failed to persist tank levels");
        }
    }

    /// Publishes one report per tracked tank, plus any pump shutoffs.
    pub async fn publish_reports(&mut self, now: Instant) -> Supervision {
        let status = self.ensure_connected().await;
        if !status.is_connected() {
            return status;
        }

        let timestamp = self.time.timestamp(now);
        for (index, tank) in self.registry.tanks().iter().enumerate() {
            if tank.config.ignore {
                continue;
            }
            let report = TankReport::new(
                &self.site.sitename,
                self.registry.tank_number(index),
                tank,
                self.site.imperial,
                timestamp.clone(),
            );
            let payload = match report.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    error!(error = %e, tank = index, "failed to encode report");
                    continue;
                }
            };
            if let Err(e) = self.session.publish(&self.site.broker.data_topic, &payload).await {
                warn!(error = %e, tank = index, "publish failed");
                return status;
            }
        }

        for request in self.registry.shutoff_requests(now) {
            warn!(
                pump_node = request.pump_node,
                pump_number = request.pump_number,
                tank = request.tank,
                reason = ?request.reason,
                "requesting pump shutoff"
            );
            match serde_json::to_vec(&request) {
                Ok(payload) => {
                    if let Err(e) = self
                        .session
                        .publish(&self.site.broker.control_topic, &payload)
                        .await
                    {
                        warn!(error = %e, "shutoff publish failed");
                    }
                }
                Err(e) => error!(error = %e, "failed to encode shutoff request"),
            }
        }
        status
    }

    /// Resyncs the clock when the interval has elapsed.
    pub async fn sync_time_if_due(&mut self, now: Instant) {
        if !self.time.is_due(now) {
            return;
        }
        if self.time.sync(now).await.is_none() {
            warn!("time unknown until next sync");
        }
    }

    /// Runs until the supervisor asks for a restart.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<InboundMessage>) -> Exit {
        info!(
            site = %self.site.sitename,
            tanks = self.registry.len(),
            "node starting"
        );
        if self.ensure_connected().await == Supervision::RestartRequested {
            return Exit::RestartRequested;
        }
        self.sync_time_if_due(Instant::now()).await;

        let mut ping = time::interval(self.site.ping_interval);
        let mut report = time::interval(self.site.report_interval);
        let mut housekeeping = time::interval(std::time::Duration::from_secs(1));
        ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        report.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        housekeeping.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    self.poll_next_tank(Instant::now());
                }
                Some(msg) = inbound.recv() => {
                    self.handle_inbound(&msg, Instant::now());
                }
                _ = report.tick() => {
                    self.registry.take_alarm_changed();
                    self.publish_reports(Instant::now()).await;
                }
                _ = housekeeping.tick() => {
                    self.ensure_connected().await;
                    self.sync_time_if_due(Instant::now()).await;
                }
            }

            if self.registry.take_alarm_changed() {
                info!("alarm state changed, reporting now");
                self.publish_reports(Instant::now()).await;
            }
            if self.supervisor.state().restart_requested {
                return Exit::RestartRequested;
            }
        }
    }
}
