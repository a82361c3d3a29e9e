//! Smartconfig provisioning: hands Wi-Fi credentials and a pairing token to a
//! device in EZ mode before it has joined any network.
//!
//! The same payload is sent two ways at once. [`broadcast`] encodes it in the
//! lengths of broadcast datagrams, [`multicast`] in multicast group addresses.
//! Packet order and spacing are part of the protocol, so transmission is
//! strictly sequential.

pub mod broadcast;
pub mod multicast;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::{
    BODY_REPEAT_COUNT, HEADER_REPEAT_COUNT, MULTICAST_TTL, PACKET_GAP, SMARTCONFIG_BROADCAST_PORT,
    SMARTCONFIG_MULTICAST_PORT,
};
use crate::error::Result;

/// What gets provisioned into the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartconfigPayload {
    pub ssid: String,
    pub password: String,
    /// region + token + secret
    pub token_group: String,
}

impl SmartconfigPayload {
    pub fn new(ssid: &str, password: &str, region: &str, token: &str, secret: &str) -> Self {
        Self {
            ssid: ssid.to_string(),
            password: password.to_string(),
            token_group: format!("{region}{token}{secret}"),
        }
    }
}

/// Both encodings of one payload, ready to transmit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmartconfigFrame {
    pub broadcast_body: Vec<u16>,
    pub multicast_head: Vec<Ipv4Addr>,
    pub multicast_body: Vec<Ipv4Addr>,
}

impl SmartconfigFrame {
    pub fn encode(payload: &SmartconfigPayload) -> Result<Self> {
        let password = payload.password.as_bytes();
        let ssid = payload.ssid.as_bytes();
        let token_group = payload.token_group.as_bytes();

        Ok(Self {
            broadcast_body: broadcast::encode_body(password, ssid, token_group)?,
            multicast_head: multicast::head(),
            multicast_body: multicast::encode_body(password, ssid, token_group)?,
        })
    }

    pub fn broadcast_head(&self) -> &'static [u16] {
        broadcast::head()
    }
}

/// Destination for smartconfig packets
#[async_trait]
pub trait PacketSink: Send {
    /// Send one zero-filled broadcast datagram of `length` bytes
    async fn send_broadcast(&mut self, length: u16) -> io::Result<()>;

    /// Send one single-byte datagram to a multicast group
    async fn send_multicast(&mut self, group: Ipv4Addr) -> io::Result<()>;
}

/// UDP socket bound to the access point address
pub struct UdpSink {
    socket: UdpSocket,
    broadcast_target: SocketAddr,
    multicast_port: u16,
    scratch: Vec<u8>,
}

impl UdpSink {
    pub async fn bind(address: Ipv4Addr) -> io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(address, 0)).await?;
        socket.set_broadcast(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        debug!("Smartconfig socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            broadcast_target: SocketAddrV4::new(Ipv4Addr::BROADCAST, SMARTCONFIG_BROADCAST_PORT).into(),
            multicast_port: SMARTCONFIG_MULTICAST_PORT,
            scratch: Vec::new(),
        })
    }
}

#[async_trait]
impl PacketSink for UdpSink {
    async fn send_broadcast(&mut self, length: u16) -> io::Result<()> {
        self.scratch.resize(length as usize, 0);
        self.socket.send_to(&self.scratch, self.broadcast_target).await?;
        Ok(())
    }

    async fn send_multicast(&mut self, group: Ipv4Addr) -> io::Result<()> {
        self.socket.send_to(&[0u8], SocketAddrV4::new(group, self.multicast_port)).await?;
        Ok(())
    }
}

/// How a run of attempts ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Every attempt went out
    Completed { attempts: usize },
    /// A stop request arrived first
    Stopped { attempts: usize },
}

/// Paces packets onto a sink in the order devices expect
pub struct SmartconfigSender<S> {
    sink: S,
    gap: Duration,
}

impl<S: PacketSink> SmartconfigSender<S> {
    pub fn new(sink: S) -> Self {
        Self { sink, gap: PACKET_GAP }
    }

    pub fn with_gap(sink: S, gap: Duration) -> Self {
        Self { sink, gap }
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    async fn broadcast_all(&mut self, lengths: &[u16]) -> io::Result<()> {
        for &length in lengths {
            self.sink.send_broadcast(length).await?;
            tokio::time::sleep(self.gap).await;
        }
        Ok(())
    }

    async fn multicast_all(&mut self, groups: &[Ipv4Addr]) -> io::Result<()> {
        for &group in groups {
            self.sink.send_multicast(group).await?;
            tokio::time::sleep(self.gap).await;
        }
        Ok(())
    }

    /// One full transmission: header rounds, then body rounds
    pub async fn send_frame(&mut self, frame: &SmartconfigFrame) -> io::Result<()> {
        for _ in 0..HEADER_REPEAT_COUNT {
            self.multicast_all(&frame.multicast_head).await?;
            self.broadcast_all(frame.broadcast_head()).await?;
        }

        for round in 0..BODY_REPEAT_COUNT {
            debug!(round, "Sending smartconfig body");
            self.multicast_all(&frame.multicast_head).await?;
            self.multicast_all(&frame.multicast_body).await?;
            self.broadcast_all(&frame.broadcast_body).await?;
        }
        Ok(())
    }

    /// Repeat the frame up to `attempts` times, pausing `retry_delay` between
    /// attempts, until `stop` turns true
    pub async fn run(
        &mut self,
        frame: &SmartconfigFrame,
        attempts: usize,
        retry_delay: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> io::Result<SendOutcome> {
        for attempt in 0..attempts {
            if *stop.borrow() {
                return Ok(SendOutcome::Stopped { attempts: attempt });
            }

            tokio::select! {
                sent = self.send_frame(frame) => sent?,
                Ok(_) = stop.wait_for(|stopped| *stopped) => {
                    return Ok(SendOutcome::Stopped { attempts: attempt });
                }
            }
            info!(attempt = attempt + 1, "SmartConfig complete");

            if attempt + 1 < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => info!("Resending SmartConfig packets"),
                    Ok(_) = stop.wait_for(|stopped| *stopped) => {
                        return Ok(SendOutcome::Stopped { attempts: attempt + 1 });
                    }
                }
            }
        }
        Ok(SendOutcome::Completed { attempts })
    }
}

/// Hook the registration server uses to end provisioning once a device has
/// fetched its token
pub trait ProvisioningControl: Send + Sync {
    fn stop(&self);
}

/// Stops a [`SmartconfigSender::run`] in the same process
#[derive(Debug, Clone)]
pub struct InProcessStop {
    tx: watch::Sender<bool>,
}

impl InProcessStop {
    pub fn channel() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }
}

impl ProvisioningControl for InProcessStop {
    fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("Stopping smartconfig");
        }
    }
}

/// Stops a standalone smartconfig process with `pkill -x <name>`.
///
/// Matches the exact process name, never the command line, so the server
/// running this cannot match itself.
#[derive(Debug, Clone)]
pub struct ProcessKill {
    name: String,
}

impl ProcessKill {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new("pkill");
        command.arg("-x").arg(&self.name);
        command
    }
}

impl ProvisioningControl for ProcessKill {
    fn stop(&self) {
        match self.command().spawn() {
            Ok(_) => info!(name = %self.name, "Stopping smartconfig process"),
            Err(e) => warn!(name = %self.name, "Failed to run pkill: {}", e),
        }
    }
}

/// Does nothing; for servers run without a provisioning stage
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProvisioning;

impl ProvisioningControl for NoProvisioning {
    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Packet {
        Broadcast(u16),
        Multicast(Ipv4Addr),
    }

    #[derive(Default)]
    struct Recorder {
        packets: Vec<Packet>,
    }

    #[async_trait]
    impl PacketSink for Recorder {
        async fn send_broadcast(&mut self, length: u16) -> io::Result<()> {
            self.packets.push(Packet::Broadcast(length));
            Ok(())
        }

        async fn send_multicast(&mut self, group: Ipv4Addr) -> io::Result<()> {
            self.packets.push(Packet::Multicast(group));
            Ok(())
        }
    }

    fn default_frame() -> SmartconfigFrame {
        let payload = SmartconfigPayload::new("vtrust-flash", "", "US", "00000000", "0101");
        SmartconfigFrame::encode(&payload).unwrap()
    }

    #[test]
    fn test_token_group_concatenation() {
        let payload = SmartconfigPayload::new("vtrust-flash", "", "US", "00000000", "0101");
        assert_eq!(payload.token_group, "US000000000101");
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_packet_order() {
        let frame = default_frame();
        let mut sender = SmartconfigSender::new(Recorder::default());
        sender.send_frame(&frame).await.unwrap();
        let packets = sender.into_sink().packets;

        let header_round = frame.multicast_head.len() + 4;
        let body_round = frame.multicast_head.len() + frame.multicast_body.len() + frame.broadcast_body.len();
        assert_eq!(packets.len(), 40 * header_round + 10 * body_round);

        // Header round: multicast head then broadcast head
        assert_eq!(packets[0], Packet::Multicast(Ipv4Addr::new(226, 120, 89, 84)));
        assert_eq!(&packets[3..7], &[1, 3, 6, 10].map(Packet::Broadcast));

        // First body round starts with the multicast head after all header rounds
        let body_start = 40 * header_round;
        assert_eq!(packets[body_start], Packet::Multicast(Ipv4Addr::new(226, 120, 89, 84)));
        assert_eq!(packets[body_start + 3], Packet::Multicast(Ipv4Addr::new(226, 64, 12, 12)));
        assert_eq!(packets.last(), Some(&Packet::Broadcast(256)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_after_every_packet() {
        let frame = default_frame();
        let mut sender = SmartconfigSender::new(Recorder::default());
        let started = tokio::time::Instant::now();
        sender.send_frame(&frame).await.unwrap();
        let sent = sender.into_sink().packets.len() as u32;
        assert!(started.elapsed() >= PACKET_GAP * sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_all_attempts() {
        let frame = default_frame();
        let (_stop, rx) = InProcessStop::channel();
        let mut sender = SmartconfigSender::with_gap(Recorder::default(), Duration::ZERO);
        let outcome = sender.run(&frame, 3, Duration::from_secs(3), rx).await.unwrap();
        assert_eq!(outcome, SendOutcome::Completed { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_start() {
        let frame = default_frame();
        let (stop, rx) = InProcessStop::channel();
        stop.stop();
        let mut sender = SmartconfigSender::new(Recorder::default());
        let outcome = sender.run(&frame, 10, Duration::from_secs(3), rx).await.unwrap();
        assert_eq!(outcome, SendOutcome::Stopped { attempts: 0 });
        assert!(sender.into_sink().packets.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_retry_delay() {
        let frame = default_frame();
        let (stop, rx) = InProcessStop::channel();
        let mut sender = SmartconfigSender::with_gap(Recorder::default(), Duration::ZERO);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            stop.stop();
        });
        let outcome = sender.run(&frame, 10, Duration::from_secs(3), rx).await.unwrap();
        stopper.await.unwrap();
        assert_eq!(outcome, SendOutcome::Stopped { attempts: 1 });
    }

    #[test]
    fn test_process_kill_matches_exact_name() {
        let kill = ProcessKill::new("smartconfig");
        let command = kill.command();
        let args: Vec<&str> = command.as_std().get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(command.as_std().get_program().to_str(), Some("pkill"));
        assert_eq!(args, ["-x", "smartconfig"]);
    }
}
