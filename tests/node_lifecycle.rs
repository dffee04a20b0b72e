//! Boot, recovery and reporting scenarios for a whole node, driven with
//! scripted link, broker, clock and sonar stand-ins.

use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use tankmon::alarm::AlarmKind;
use tankmon::config::{ConfigStore, Credentials, MAX_TANKS};
use tankmon::connectivity::Supervision;
use tankmon::net::{BrokerSession, InboundMessage, LinkError, NetworkLink, SessionError};
use tankmon::node::{Node, RangeSensor};
use tankmon::storage::PersistStore;
use tankmon::tank::SampleOutcome;
use tankmon::timesync::{TimeTransport, NTP_PACKET_SIZE};
use tankmon::types::{ShutoffReason, ShutoffRequest, TankReport};

struct FakeLink {
    reachable: Vec<&'static str>,
    up: bool,
}

impl FakeLink {
    fn reaching(reachable: Vec<&'static str>) -> Self {
        Self {
            reachable,
            up: false,
        }
    }
}

impl NetworkLink for FakeLink {
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), LinkError> {
        if self.reachable.contains(&credentials.ssid.as_str()) {
            self.up = true;
            Ok(())
        } else {
            Err(LinkError::Unreachable {
                ssid: credentials.ssid.clone(),
            })
        }
    }

    fn is_connected(&self) -> bool {
        self.up
    }
}

/// Every `(topic, payload)` the node published, shared with the test.
type Published = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

#[derive(Default)]
struct FakeBroker {
    up: bool,
    published: Published,
}

impl BrokerSession for FakeBroker {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.up = true;
        Ok(())
    }

    async fn subscribe(&mut self, _topic: &str) -> Result<(), SessionError> {
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.up
    }
}

struct NoClock;

impl TimeTransport for NoClock {
    async fn exchange(
        &mut self,
        _server: &str,
        _request: &[u8; NTP_PACKET_SIZE],
        _wait: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn reset(&mut self) {}
}

#[derive(Default)]
struct QueuedSonar {
    pings: VecDeque<Option<f32>>,
}

impl RangeSensor for QueuedSonar {
    fn ping_cm(&mut self, _tank: usize) -> Option<f32> {
        self.pings.pop_front().flatten()
    }
}

fn site_document() -> Value {
    json!({
        "site": {
            "sitename": "testsite",
            "pssid": "primary", "ppwd": "pw",
            "usealtssid": true, "altssid": "alternate", "altpwd": "pw",
            "timezone": -5, "dst": false,
            "mqtt_server": "localhost", "mqtt_port": 1883,
            "mqtt_uid": "u", "mqtt_pwd": "p",
            "mqtt_topic_data": "site/tanks", "mqtt_topic_ctrl": "site/ctrl",
            "otapwd": "ota", "numtanks": 2, "startingTankNum": 0,
            "imperial": false, "useavg": false, "debug": false,
            "tankpingdelay": 5000, "blynkauthtoken": "token",
            "wifiretrycnt": 2, "wifiretrydelay": 0,
            "mqttretrycnt": 2, "mqttretrydelay": 0
        },
        "tankdefs": [
            {
                "tankType": "W", "ignore": false, "timeout": 60,
                "depth": 95.25, "vCM": 10.8, "sensorOffset": 21,
                "sonarTrigPin": 5, "sonarEchoPin": 4,
                "loAlarmFactor": 0.10, "hiAlarmFactor": 1.10,
                "pumpnode": 0, "pumpnumber": 0
            },
            {
                "tankType": "W", "ignore": false, "timeout": 60,
                "depth": 95.5, "vCM": 10.8, "sensorOffset": 19,
                "sonarTrigPin": 14, "sonarEchoPin": 12,
                "loAlarmFactor": 0.10, "hiAlarmFactor": 1.10,
                "pumpnode": 0, "pumpnumber": 0
            }
        ]
    })
}

type TestNode = Node<FakeLink, FakeBroker, NoClock, QueuedSonar>;

fn boot_with(root: &Path, doc: Value, link: FakeLink, sonar: QueuedSonar) -> (TestNode, Published) {
    fs::write(root.join("tanksmoncfg.json"), doc.to_string()).unwrap();
    let store = ConfigStore::new(root);
    let (site, tanks) = store.load().unwrap();
    let persist = PersistStore::new(root, MAX_TANKS);
    let broker = FakeBroker::default();
    let published = broker.published.clone();
    let node = Node::boot(site, tanks, persist, link, broker, NoClock, sonar);
    (node, published)
}

fn boot(root: &Path, link: FakeLink, sonar: QueuedSonar) -> TestNode {
    boot_with(root, site_document(), link, sonar).0
}

fn on_topic<T: serde::de::DeserializeOwned>(published: &Published, topic: &str) -> Vec<T> {
    published
        .lock()
        .unwrap()
        .iter()
        .filter(|(t, _)| t == topic)
        .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
        .collect()
}

#[test]
fn test_boot_recovers_persisted_levels() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("tanksmonpersist.json"),
        r#"[{"level":42.0},{"level":10.0}]"#,
    )
    .unwrap();

    let node = boot(dir.path(), FakeLink::reaching(vec!["primary"]), QueuedSonar::default());
    let reg = node.registry();
    assert_eq!(reg.get(0).unwrap().state.liquid_depth_avg, 42.0);
    assert_eq!(reg.get(1).unwrap().state.liquid_depth_avg, 10.0);
    assert!(reg.get(0).unwrap().state.last_msg_time.is_none());
}

#[test]
fn test_first_boot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let node = boot(dir.path(), FakeLink::reaching(vec!["primary"]), QueuedSonar::default());
    assert_eq!(node.registry().levels(), vec![0.0, 0.0]);
}

#[test]
fn test_low_sample_alarms_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    // 95.25 - (111.25 - 21) = 5.0
    let sonar = QueuedSonar {
        pings: VecDeque::from(vec![Some(111.25), Some(500.0)]),
    };
    let mut node = boot(dir.path(), FakeLink::reaching(vec!["primary"]), sonar);

    let out = node.poll_next_tank(Instant::now());
    assert_eq!(out, SampleOutcome::Accepted { alarm_changed: true });
    let alarms = node.registry().get(0).unwrap().state.alarms.current;
    assert_eq!(alarms.iter().collect::<Vec<_>>(), vec![AlarmKind::Low]);

    // out of range on tank 1 is dropped and does not touch the record
    assert_eq!(node.poll_next_tank(Instant::now()), SampleOutcome::Discarded);

    let persisted = PersistStore::new(dir.path(), MAX_TANKS).load().unwrap();
    assert!((persisted[0] - 5.0).abs() < 1e-4);
    assert_eq!(persisted[1], 0.0);
}

#[tokio::test]
async fn test_reports_after_falling_back_to_alternate() {
    let dir = tempfile::tempdir().unwrap();
    let sonar = QueuedSonar {
        pings: VecDeque::from(vec![Some(111.25)]),
    };
    let mut node = boot(dir.path(), FakeLink::reaching(vec!["alternate"]), sonar);
    node.poll_next_tank(Instant::now());

    let status = node.publish_reports(Instant::now()).await;
    assert_eq!(status, Supervision::Reconnected);
    assert_eq!(node.supervisor().active_credentials().ssid, "alternate");
}

#[tokio::test]
async fn test_restart_requested_when_no_network() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = boot(dir.path(), FakeLink::reaching(vec![]), QueuedSonar::default());
    assert_eq!(node.ensure_connected().await, Supervision::RestartRequested);
    assert!(node.supervisor().state().restart_requested);
    // restart is terminal; later cycles do not retry
    assert_eq!(node.publish_reports(Instant::now()).await, Supervision::RestartRequested);
}

#[test]
fn test_relayed_report_updates_tank() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = boot(dir.path(), FakeLink::reaching(vec!["primary"]), QueuedSonar::default());

    let tank = node.registry().get(1).unwrap().clone();
    let mut report = TankReport::new("remote", 1, &tank, false, None);
    report.liquid_depth = 60.0;
    let msg = InboundMessage {
        topic: "site/ctrl".to_string(),
        payload: report.encode().unwrap(),
    };
    let out = node.handle_inbound(&msg, Instant::now());
    assert!(out.is_accepted());
    assert_eq!(node.registry().get(1).unwrap().state.liquid_depth, 60.0);

    report.tank = 9;
    let msg = InboundMessage {
        topic: "site/ctrl".to_string(),
        payload: report.encode().unwrap(),
    };
    assert_eq!(node.handle_inbound(&msg, Instant::now()), SampleOutcome::Discarded);

    let garbage = InboundMessage {
        topic: "site/ctrl".to_string(),
        payload: b"pump 3 off".to_vec(),
    };
    assert_eq!(node.handle_inbound(&garbage, Instant::now()), SampleOutcome::Discarded);
}

#[tokio::test]
async fn test_publish_skips_ignored_tanks_and_requests_shutoff() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = site_document();
    doc["tankdefs"][0]["pumpnode"] = json!(3);
    doc["tankdefs"][0]["pumpnumber"] = json!(2);
    doc["tankdefs"][1]["ignore"] = json!(true);
    let sonar = QueuedSonar {
        pings: VecDeque::from(vec![Some(111.25)]),
    };
    let (mut node, published) =
        boot_with(dir.path(), doc, FakeLink::reaching(vec!["primary"]), sonar);
    let now = Instant::now();
    node.poll_next_tank(now);

    assert_eq!(node.publish_reports(now).await, Supervision::Reconnected);
    assert!(node.time_source().timestamp(now).is_none());

    let reports: Vec<TankReport> = on_topic(&published, "site/tanks");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].tank, 0);
    assert_eq!(reports[0].node, "testsite");
    assert_eq!(reports[0].alarm_flags, AlarmKind::Low.bit());
    assert!(reports[0].timestamp.is_none());

    let raw = published.lock().unwrap()[0].1.clone();
    let value: Value = serde_json::from_slice(&raw).unwrap();
    assert!(value.get("ts").is_none());

    let shutoffs: Vec<ShutoffRequest> = on_topic(&published, "site/ctrl");
    assert_eq!(
        shutoffs,
        vec![ShutoffRequest {
            pump_node: 3,
            pump_number: 2,
            tank: 0,
            reason: ShutoffReason::LowWater,
        }]
    );
}

#[tokio::test]
async fn test_alarm_change_publishes_before_next_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = site_document();
    // an hour between cycles; only the alarm path can publish again in time
    doc["site"]["tankpingdelay"] = json!(3_600_000);
    doc["site"]["senddatadelay"] = json!(3_600_000);
    let (node, published) = boot_with(
        dir.path(),
        doc,
        FakeLink::reaching(vec!["primary"]),
        QueuedSonar::default(),
    );

    let tank = node.registry().get(0).unwrap().clone();
    let mut report = TankReport::new("remote", 0, &tank, false, None);
    report.liquid_depth = 5.0;
    let relayed = InboundMessage {
        topic: "site/ctrl".to_string(),
        payload: report.encode().unwrap(),
    };

    let (tx, rx) = mpsc::channel(4);
    let low_reported = || {
        on_topic::<TankReport>(&published, "site/tanks")
            .iter()
            .any(|r| r.tank == 0 && r.alarm_flags == AlarmKind::Low.bit())
    };
    let driver = async {
        // first cycle fires at startup
        while on_topic::<TankReport>(&published, "site/tanks").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!low_reported());
        tx.send(relayed).await.unwrap();
        while !low_reported() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    tokio::select! {
        exit = node.run(rx) => panic!("node stopped: {exit:?}"),
        done = tokio::time::timeout(Duration::from_secs(5), driver) => {
            assert!(done.is_ok(), "alarm change was not published");
        }
    }
}
