//! Keeps the wireless link and the broker session up.
//!
//! Both loops block their caller until connected or until their retry budget
//! is spent. Exhaustion never reboots anything here: it parks the supervisor
//! in [`Supervision::RestartRequested`] and leaves the restart to the process
//! owner.

use tracing::{error, info, warn};

use crate::config::{Credentials, RetryPolicy};
use crate::net::{BrokerSession, NetworkLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSlot {
    Primary,
    Alternate,
}

/// Result of an `ensure_*` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervision {
    /// Was already up; nothing was done.
    AlreadyConnected,
    /// A fresh connection was established during this call.
    Reconnected,
    /// Retry budget spent. Terminal.
    RestartRequested,
}

impl Supervision {
    pub fn is_connected(self) -> bool {
        !matches!(self, Supervision::RestartRequested)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub active: CredentialSlot,
    pub link: LinkState,
    pub session: LinkState,
    pub link_failures: u32,
    pub session_failures: u32,
    pub restart_requested: bool,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            active: CredentialSlot::Primary,
            link: LinkState::Disconnected,
            session: LinkState::Disconnected,
            link_failures: 0,
            session_failures: 0,
            restart_requested: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub retry: RetryPolicy,
    /// Topic to subscribe to after every successful connect.
    pub control_topic: Option<String>,
}

pub struct ConnectivitySupervisor {
    primary: Credentials,
    alternate: Option<Credentials>,
    link_policy: RetryPolicy,
    session_policy: SessionPolicy,
    state: ConnectionState,
}

impl ConnectivitySupervisor {
    pub fn new(
        primary: Credentials,
        alternate: Option<Credentials>,
        link_policy: RetryPolicy,
        session_policy: SessionPolicy,
    ) -> Self {
        Self {
            primary,
            alternate,
            link_policy,
            session_policy,
            state: ConnectionState::default(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn active_credentials(&self) -> &Credentials {
        match (self.state.active, &self.alternate) {
            (CredentialSlot::Alternate, Some(alt)) => alt,
            _ => &self.primary,
        }
    }

    fn request_restart(&mut self, what: &str) -> Supervision {
        error!(what, "retry budget exhausted, restart requested");
        self.state.restart_requested = true;
        Supervision::RestartRequested
    }

    /// Brings the link up, retrying with backoff, falling back once to the
    /// alternate credentials.
    pub async fn ensure_link<L: NetworkLink>(&mut self, link: &mut L) -> Supervision {
        if self.state.restart_requested {
            return Supervision::RestartRequested;
        }
        if link.is_connected() {
            self.state.link = LinkState::Connected;
            return Supervision::AlreadyConnected;
        }

        self.state.link = LinkState::Connecting;
        self.state.session = LinkState::Disconnected;
        loop {
            let credentials = self.active_credentials().clone();
            info!(ssid = %credentials.ssid, "wifi connecting");
            match link.connect(&credentials).await {
                Ok(()) => {
                    self.state.link = LinkState::Connected;
                    self.state.link_failures = 0;
                    info!(ssid = %credentials.ssid, "wifi connected");
                    return Supervision::Reconnected;
                }
                Err(e) => {
                    self.state.link_failures += 1;
                    warn!(error = %e, failures = self.state.link_failures, "wifi connect failed");
                }
            }

            if self.state.link_failures > self.link_policy.retry_limit {
                self.state.link_failures = 0;
                if self.alternate.is_some() && self.state.active == CredentialSlot::Primary {
                    self.state.active = CredentialSlot::Alternate;
                    info!(ssid = %self.active_credentials().ssid, "switching to alternate network");
                    continue;
                }
                if self.link_policy.reboot_on_exhaustion {
                    self.state.link = LinkState::Disconnected;
                    return self.request_restart("wifi");
                }
            }
            tokio::time::sleep(self.link_policy.delay).await;
        }
    }

    /// Brings the broker session up, subscribing to the control topic on
    /// every fresh connect.
    pub async fn ensure_session<S: BrokerSession>(&mut self, session: &mut S) -> Supervision {
        if self.state.restart_requested {
            return Supervision::RestartRequested;
        }
        if session.is_connected() {
            self.state.session = LinkState::Connected;
            return Supervision::AlreadyConnected;
        }

        self.state.session = LinkState::Connecting;
        loop {
            let attempt = match session.connect().await {
                Ok(()) => match &self.session_policy.control_topic {
                    Some(topic) => session.subscribe(topic).await,
                    None => Ok(()),
                },
                Err(e) => Err(e),
            };
            match attempt {
                Ok(()) => {
                    self.state.session = LinkState::Connected;
                    self.state.session_failures = 0;
                    return Supervision::Reconnected;
                }
                Err(e) => {
                    self.state.session_failures += 1;
                    warn!(
                        error = %e,
                        failures = self.state.session_failures,
                        "broker connect failed"
                    );
                }
            }

            if self.state.session_failures > self.session_policy.retry.retry_limit {
                self.state.session = LinkState::Disconnected;
                return self.request_restart("broker");
            }
            tokio::time::sleep(self.session_policy.retry.delay).await;
        }
    }
}
