//! Periodic wall-clock sync against an NTP server.

use chrono::{DateTime, NaiveDateTime};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, info, warn};

pub const NTP_PACKET_SIZE: usize = 48;
pub const NTP_PORT: u16 = 123;
pub const LOCAL_PORT: u16 = 8888;
pub const NTP_RETRY_COUNT: u32 = 3;
pub const NTP_WAIT: Duration = Duration::from_secs(3);

/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_UNIX_DELTA: u64 = 2_208_988_800;
const TRANSMIT_TIMESTAMP_OFFSET: usize = 40;

pub fn request_packet() -> [u8; NTP_PACKET_SIZE] {
    let mut packet = [0u8; NTP_PACKET_SIZE];
    packet[0] = 0b1110_0011; // LI, version, mode
    packet[1] = 0; // stratum
    packet[2] = 6; // polling interval
    packet[3] = 0xEC; // peer clock precision
    packet[12] = 49;
    packet[13] = 0x4E;
    packet[14] = 49;
    packet[15] = 52;
    packet
}

/// Seconds since 1900 from the transmit timestamp of a response.
pub fn decode_seconds(packet: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = packet
        .get(TRANSMIT_TIMESTAMP_OFFSET..TRANSMIT_TIMESTAMP_OFFSET + 8)?
        .try_into()
        .ok()?;
    Some(u64::from_be_bytes(raw) >> 32)
}

/// NTP seconds to a local-time Unix epoch with a fixed offset.
pub fn to_local_epoch(ntp_seconds: u64, utc_offset_secs: i64) -> Option<i64> {
    let unix = ntp_seconds.checked_sub(NTP_UNIX_DELTA)?;
    Some(unix as i64 + utc_offset_secs)
}

#[allow(async_fn_in_trait)]
pub trait TimeTransport {
    /// Sends one request and waits up to `wait` for a full-size response.
    async fn exchange(
        &mut self,
        server: &str,
        request: &[u8; NTP_PACKET_SIZE],
        wait: Duration,
    ) -> io::Result<Option<Vec<u8>>>;

    /// Drops the listener so the next exchange binds it again.
    fn reset(&mut self);
}

pub struct UdpTimeTransport {
    local_port: u16,
    socket: Option<UdpSocket>,
}

impl UdpTimeTransport {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            socket: None,
        }
    }

    async fn socket(&mut self) -> io::Result<&UdpSocket> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind(("0.0.0.0", self.local_port)).await?;
            debug!(port = self.local_port, "udp listener started");
            self.socket = Some(socket);
        }
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "udp listener missing"))
    }
}

impl TimeTransport for UdpTimeTransport {
    async fn exchange(
        &mut self,
        server: &str,
        request: &[u8; NTP_PACKET_SIZE],
        wait: Duration,
    ) -> io::Result<Option<Vec<u8>>> {
        let addr: SocketAddr = lookup_host((server, NTP_PORT))
            .await?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no IPv4 address"))?;
        let socket = self.socket().await?;

        let mut buf = [0u8; 128];
        // discard anything left over from an earlier cycle
        while socket.try_recv_from(&mut buf).is_ok() {}

        debug!(%server, %addr, "sending ntp request");
        socket.send_to(request, addr).await?;

        let response = tokio::time::timeout(wait, async {
            loop {
                let (size, _) = socket.recv_from(&mut buf).await?;
                if size >= NTP_PACKET_SIZE {
                    return Ok::<_, io::Error>(buf[..NTP_PACKET_SIZE].to_vec());
                }
            }
        })
        .await;
        match response {
            Ok(packet) => packet.map(Some),
            Err(_) => Ok(None),
        }
    }

    fn reset(&mut self) {
        self.socket = None;
    }
}

#[derive(Debug, Clone)]
pub struct TimeSettings {
    pub server: String,
    /// Whole hours from UTC.
    pub timezone: i32,
    /// Adds one hour when set; never derived from the date.
    pub dst: bool,
    pub sync_interval: Duration,
    pub retries: u32,
    pub wait: Duration,
}

impl TimeSettings {
    pub fn utc_offset_secs(&self) -> i64 {
        (self.timezone as i64 + i64::from(self.dst)) * 3600
    }
}

pub struct TimeSource<T> {
    transport: T,
    settings: TimeSettings,
    synced: Option<(i64, Instant)>,
    last_attempt: Option<Instant>,
}

impl<T: TimeTransport> TimeSource<T> {
    pub fn new(transport: T, settings: TimeSettings) -> Self {
        Self {
            transport,
            settings,
            synced: None,
            last_attempt: None,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.settings.sync_interval,
        }
    }

    pub fn reset_listener(&mut self) {
        self.transport.reset();
    }

    /// Queries the server. `None` means the time is unknown for this cycle;
    /// a previous sync, if any, keeps running.
    pub async fn sync(&mut self, now: Instant) -> Option<i64> {
        self.last_attempt = Some(now);
        let request = request_packet();
        for attempt in 1..=self.settings.retries {
            match self
                .transport
                .exchange(&self.settings.server, &request, self.settings.wait)
                .await
            {
                Ok(Some(packet)) => {
                    let epoch = decode_seconds(&packet)
                        .and_then(|s| to_local_epoch(s, self.settings.utc_offset_secs()));
                    if let Some(epoch) = epoch {
                        info!(epoch, "time synced");
                        self.synced = Some((epoch, now));
                        return Some(epoch);
                    }
                    warn!(attempt, "unusable ntp response");
                }
                Ok(None) => debug!(attempt, "no ntp response, retrying"),
                Err(e) => warn!(attempt, error = %e, "ntp request failed"),
            }
        }
        warn!(server = %self.settings.server, "no ntp response");
        None
    }

    /// Local wall-clock time, if a sync has ever succeeded.
    pub fn local_time(&self, now: Instant) -> Option<NaiveDateTime> {
        let (epoch, at) = self.synced?;
        let elapsed = now.saturating_duration_since(at).as_secs() as i64;
        DateTime::from_timestamp(epoch + elapsed, 0).map(|dt| dt.naive_utc())
    }

    /// `YYYY-M-D HH:MM:SS`, or `None` while the time is unknown.
    pub fn timestamp(&self, now: Instant) -> Option<String> {
        self.local_time(now)
            .map(|t| t.format("%Y-%-m-%-d %H:%M:%S").to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves canned responses in order; `None` entries time out.
    struct CannedTransport {
        responses: Vec<Option<Vec<u8>>>,
        requests: usize,
        resets: usize,
    }

    impl TimeTransport for CannedTransport {
        async fn exchange(
            &mut self,
            _server: &str,
            request: &[u8; NTP_PACKET_SIZE],
            _wait: Duration,
        ) -> io::Result<Option<Vec<u8>>> {
            assert_eq!(request[0], 0xE3);
            self.requests += 1;
            if self.responses.is_empty() {
                return Ok(None);
            }
            Ok(self.responses.remove(0))
        }

        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn response(ntp_seconds: u32) -> Vec<u8> {
        let mut packet = vec![0u8; NTP_PACKET_SIZE];
        packet[40..44].copy_from_slice(&ntp_seconds.to_be_bytes());
        packet[44..48].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        packet
    }

    fn settings(timezone: i32, dst: bool) -> TimeSettings {
        TimeSettings {
            server: "pool.test".to_string(),
            timezone,
            dst,
            sync_interval: Duration::from_secs(300),
            retries: NTP_RETRY_COUNT,
            wait: Duration::ZERO,
        }
    }

    // 2020-12-08 12:00:00 UTC
    const UNIX: u64 = 1_607_428_800;

    #[test]
    fn test_request_layout() {
        let p = request_packet();
        assert_eq!(p.len(), 48);
        assert_eq!(&p[..4], &[0xE3, 0, 6, 0xEC]);
        assert_eq!(&p[12..16], &[49, 0x4E, 49, 52]);
    }

    #[test]
    fn test_decode() {
        let packet = response((UNIX + NTP_UNIX_DELTA) as u32);
        assert_eq!(decode_seconds(&packet), Some(UNIX + NTP_UNIX_DELTA));
        assert_eq!(decode_seconds(&packet[..40]), None);
        assert_eq!(to_local_epoch(UNIX + NTP_UNIX_DELTA, -5 * 3600), Some(UNIX as i64 - 18_000));
        assert_eq!(to_local_epoch(5, 0), None);
    }

    #[tokio::test]
    async fn test_sync_after_retry() {
        let transport = CannedTransport {
            responses: vec![None, Some(response((UNIX + NTP_UNIX_DELTA) as u32))],
            requests: 0,
            resets: 0,
        };
        let mut source = TimeSource::new(transport, settings(-5, true));
        let now = Instant::now();
        assert_eq!(source.sync(now).await, Some(UNIX as i64 - 4 * 3600));
        assert_eq!(source.transport.requests, 2);
        assert_eq!(
            source.timestamp(now + Duration::from_secs(61)).as_deref(),
            Some("2020-12-8 08:01:01")
        );
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let transport = CannedTransport {
            responses: vec![],
            requests: 0,
            resets: 0,
        };
        let mut source = TimeSource::new(transport, settings(0, false));
        let now = Instant::now();
        assert!(source.is_due(now));
        assert_eq!(source.sync(now).await, None);
        assert_eq!(source.transport.requests, 3);
        assert!(source.timestamp(now).is_none());
        assert!(!source.is_due(now + Duration::from_secs(10)));
        assert!(source.is_due(now + Duration::from_secs(300)));

        source.reset_listener();
        assert_eq!(source.transport.resets, 1);
    }
}
