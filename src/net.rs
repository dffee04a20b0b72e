use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{BrokerConfig, Credentials};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("network {ssid} unreachable")]
    Unreachable { ssid: String },
    #[error("association with {ssid} failed: {reason}")]
    Rejected { ssid: String, reason: String },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("broker connection failed: {0}")]
    Connect(String),
    #[error("broker refused connection: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Caller-supplied handler for inbound messages.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// The wireless link underneath everything else.
#[allow(async_fn_in_trait)]
pub trait NetworkLink {
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), LinkError>;
    fn is_connected(&self) -> bool;
}

/// A publish/subscribe session with the broker.
#[allow(async_fn_in_trait)]
pub trait BrokerSession {
    async fn connect(&mut self) -> Result<(), SessionError>;
    async fn subscribe(&mut self, topic: &str) -> Result<(), SessionError>;
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError>;
    fn is_connected(&self) -> bool;
}

/// MQTT session over rumqttc. Incoming publishes are handed to the handler
/// from a background task that also drives the connection.
pub struct MqttSession {
    options: MqttOptions,
    connect_timeout: Duration,
    handler: MessageHandler,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl MqttSession {
    pub fn new(broker: &BrokerConfig, client_id: &str, handler: MessageHandler) -> Self {
        let mut options = MqttOptions::new(client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !broker.username.is_empty() {
            options.set_credentials(&broker.username, &broker.password);
        }
        Self {
            options,
            connect_timeout: Duration::from_secs(10),
            handler,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl BrokerSession for MqttSession {
    async fn connect(&mut self) -> Result<(), SessionError> {
        self.teardown();
        log::info!("Connecting to MQTT server {:?}", self.options.broker_address());

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 20);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack.code),
                    Ok(_) => continue,
                    Err(e) => return Err(SessionError::Connect(e.to_string())),
                }
            }
        };
        let code = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| SessionError::Timeout(self.connect_timeout))??;
        if code != ConnectReturnCode::Success {
            return Err(SessionError::Refused(code));
        }

        self.connected.store(true, Ordering::SeqCst);
        let connected = Arc::clone(&self.connected);
        let handler = Arc::clone(&self.handler);
        self.pump = Some(tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => handler(InboundMessage {
                        topic: p.topic.clone(),
                        payload: p.payload.to_vec(),
                    }),
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("MQTT connection lost: {}", e);
                        connected.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }));
        self.client = Some(client);
        log::info!("MQTT connected");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client.subscribe(topic, QoS::AtLeastOnce).await?;
        log::info!("MQTT topic subscribed: {}", topic);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected);
        }
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Drop for MqttSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
