//! Host network stack speaking Semtech GWMP
//!
//! The node acts as its own packet forwarder: every uplink is wrapped into
//! an `rxpk` and pushed to the network server as PUSH_DATA, and PULL_DATA
//! keepalives open the downlink path. Data-down frames arriving in a
//! PULL_RESP are handed to the [`DownlinkCommandHandler`] straight from the
//! receive task, concurrently with the main loop.
//!
//! Join is simulated: no OTAA exchange takes place, the stack just reports
//! joined after the configured number of attempts.

pub mod protocol;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use base64::Engine;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::NetworkConfig;
use crate::downlink::DownlinkCommandHandler;
use crate::lorawan::encoder::FrameBuilder;
use crate::lorawan::{self, LoRaWANFrame};
use crate::stack::{DeviceClass, NetworkStack, Region, WakeReason};
use protocol::{GatewayEui, GwmpPacket, PullRespPayload, PushDataPayload, Rxpk};

/// Spacing between failed join attempts
const JOIN_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Emulator radio metadata reported in every rxpk
const UPLINK_DATR: &str = "SF9BW125";
const UPLINK_CODR: &str = "4/5";

pub struct GwmpStack {
    link: Arc<Link>,
    dev_addr: u32,
    app_port: u8,
    fcnt_up: u16,
    region: Region,
    join_attempts_needed: u32,
    join_attempts: u32,
    joined: bool,
    deadline: Instant,
    edge: Arc<Notify>,
}

/// Socket side shared with the receive and keepalive tasks
struct Link {
    socket: UdpSocket,
    server: SocketAddr,
    gateway_eui: GatewayEui,
    dev_addr: u32,
    token: AtomicU16,
    started: Instant,
}

impl Link {
    fn next_token(&self) -> u16 {
        self.token.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, packet: &GwmpPacket) -> anyhow::Result<()> {
        self.socket.send_to(&packet.encode(), self.server).await?;
        Ok(())
    }
}

impl GwmpStack {
    /// Bind the socket and start the receive and keepalive tasks.
    ///
    /// `edge` is notified by the tip source; `sleep` wakes on it.
    pub async fn start(
        config: &NetworkConfig,
        dev_addr: u32,
        app_port: u8,
        handler: DownlinkCommandHandler,
        edge: Arc<Notify>,
    ) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(&config.bind).await?;
        let server: SocketAddr = config
            .server
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid server address {}: {}", config.server, e))?;
        info!(
            "GWMP link {} -> {} (DevAddr {:08X})",
            socket.local_addr()?,
            server,
            dev_addr
        );

        let link = Arc::new(Link {
            socket,
            server,
            gateway_eui: gateway_eui(dev_addr),
            dev_addr,
            token: AtomicU16::new(0x0100),
            started: Instant::now(),
        });

        let rx_link = link.clone();
        tokio::spawn(async move {
            if let Err(e) = receive_task(rx_link, handler).await {
                error!("GWMP receive task failed: {}", e);
            }
        });

        let keepalive_link = link.clone();
        let keepalive = Duration::from_secs(config.keepalive_secs.max(1));
        tokio::spawn(async move {
            keepalive_task(keepalive_link, keepalive).await;
        });

        Ok(Self {
            link,
            dev_addr,
            app_port,
            fcnt_up: 0,
            region: Region::EU868,
            join_attempts_needed: config.join_attempts,
            join_attempts: 0,
            joined: false,
            deadline: Instant::now(),
            edge,
        })
    }

    fn rxpk(&self, phy: &[u8]) -> Rxpk {
        Rxpk {
            time: Some(chrono::Utc::now().to_rfc3339()),
            tmst: self.link.started.elapsed().as_micros() as u32,
            chan: 0,
            rfch: 0,
            freq: self.region.uplink_freq_mhz(),
            stat: 1,
            modu: "LORA".to_string(),
            datr: UPLINK_DATR.to_string(),
            codr: UPLINK_CODR.to_string(),
            rssi: -60.0,
            lsnr: 9.5,
            size: phy.len() as u16,
            data: base64::engine::general_purpose::STANDARD.encode(phy),
        }
    }
}

impl NetworkStack for GwmpStack {
    async fn init(&mut self, class: DeviceClass, region: Region) {
        self.region = region;
        self.joined = false;
        self.join_attempts = 0;
        info!(
            "LoRaWAN stack up: {}, {} ({} MHz uplink)",
            class,
            region,
            region.uplink_freq_mhz()
        );
    }

    async fn join(&mut self) {
        if self.joined {
            return;
        }

        self.join_attempts += 1;
        if self.join_attempts >= self.join_attempts_needed {
            self.joined = true;
            info!("Joined after {} attempt(s)", self.join_attempts);
        } else {
            info!(
                "Join attempt {} failed, retrying in {:?}",
                self.join_attempts, JOIN_RETRY_DELAY
            );
            tokio::time::sleep(JOIN_RETRY_DELAY).await;
        }
    }

    fn is_joined(&self) -> bool {
        self.joined
    }

    async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        if !self.joined {
            return Err(anyhow::anyhow!("No session"));
        }

        let phy = FrameBuilder::new_uplink(self.dev_addr, self.fcnt_up, self.app_port, payload.to_vec())
            .build();
        let body = PushDataPayload {
            rxpk: Some(vec![self.rxpk(&phy)]),
            stat: None,
        };

        let packet = GwmpPacket::PushData {
            random_token: self.link.next_token(),
            gateway_eui: self.link.gateway_eui,
            json_payload: serde_json::to_string(&body)?,
        };
        self.link.send(&packet).await?;

        info!(
            "Uplink FCnt={} FPort={} ({} bytes) pushed to {}",
            self.fcnt_up,
            self.app_port,
            payload.len(),
            self.link.server
        );
        self.fcnt_up = self.fcnt_up.wrapping_add(1);
        Ok(())
    }

    fn cycle(&mut self, delay_ms: u32) {
        self.deadline = Instant::now() + Duration::from_millis(delay_ms as u64);
    }

    async fn sleep(&mut self) -> WakeReason {
        tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => WakeReason::Timer,
            _ = self.edge.notified() => WakeReason::Edge,
        }
    }
}

/// Derive a stable gateway EUI from the DevAddr
fn gateway_eui(dev_addr: u32) -> GatewayEui {
    let mut eui = [0xFE, 0xFF, 0x52, 0x47, 0, 0, 0, 0];
    eui[4..].copy_from_slice(&dev_addr.to_be_bytes());
    eui
}

async fn keepalive_task(link: Arc<Link>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let packet = GwmpPacket::PullData {
            random_token: link.next_token(),
            gateway_eui: link.gateway_eui,
        };
        if let Err(e) = link.send(&packet).await {
            warn!("Failed to send PULL_DATA: {}", e);
        }
    }
}

async fn receive_task(link: Arc<Link>, handler: DownlinkCommandHandler) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = link.socket.recv_from(&mut buf).await?;
        if src != link.server {
            debug!("Ignoring {} bytes from {}", len, src);
            continue;
        }

        match GwmpPacket::parse(&buf[..len]) {
            Ok(GwmpPacket::PushAck { random_token }) => {
                debug!("PUSH_ACK (token: 0x{:04x})", random_token);
            }
            Ok(GwmpPacket::PullAck { random_token }) => {
                debug!("PULL_ACK (token: 0x{:04x})", random_token);
            }
            Ok(GwmpPacket::PullResp {
                random_token,
                json_payload,
            }) => {
                let error = handle_pull_resp(&link, &json_payload, &handler).err();
                if let Some(e) = &error {
                    warn!("Dropped PULL_RESP: {}", e);
                }

                let ack = GwmpPacket::TxAck {
                    random_token,
                    gateway_eui: link.gateway_eui,
                    json_payload: error.map(|_| r#"{"txpk_ack":{"error":"TX_FREQ"}}"#.to_string()),
                };
                if let Err(e) = link.send(&ack).await {
                    error!("Failed to send TX_ACK: {}", e);
                }
            }
            Ok(other) => {
                debug!("Unexpected {:?} from server", other.packet_type());
            }
            Err(e) => {
                warn!("Failed to parse GWMP packet from {}: {}", src, e);
            }
        }
    }
}

/// Decode a PULL_RESP and deliver any data-down frame to the handler
fn handle_pull_resp(
    link: &Link,
    json_payload: &str,
    handler: &DownlinkCommandHandler,
) -> anyhow::Result<()> {
    let body: PullRespPayload = serde_json::from_str(json_payload)?;
    let phy = base64::engine::general_purpose::STANDARD
        .decode(&body.txpk.data)
        .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))?;

    match lorawan::decode_phy_payload(&phy)? {
        LoRaWANFrame::Data(frame) if frame.mtype.is_downlink() => {
            if frame.dev_addr != link.dev_addr {
                debug!("Downlink for {:08X}, not us", frame.dev_addr);
                return Ok(());
            }
            info!("Downlink: {}", LoRaWANFrame::Data(frame.clone()));
            if let Some(port) = frame.f_port {
                handler.on_message(port, &frame.frm_payload);
            }
            Ok(())
        }
        other => {
            debug!("Skipping non-downlink frame: {}", other);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::DutyCycleConfig;
    use crate::shared::SharedState;

    fn pull_resp_json(phy: &[u8]) -> String {
        format!(
            r#"{{"txpk":{{"imme":true,"freq":869.525,"rfch":0,"powe":14,"modu":"LORA","datr":"SF9BW125","codr":"4/5","ipol":true,"size":{},"data":"{}"}}}}"#,
            phy.len(),
            base64::engine::general_purpose::STANDARD.encode(phy)
        )
    }

    async fn link(dev_addr: u32) -> Link {
        Link {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            server: "127.0.0.1:1680".parse().unwrap(),
            gateway_eui: gateway_eui(dev_addr),
            dev_addr,
            token: AtomicU16::new(0),
            started: Instant::now(),
        }
    }

    fn shared() -> (Arc<SharedState>, DownlinkCommandHandler) {
        let shared = Arc::new(SharedState::new(DutyCycleConfig::default(), 500));
        (shared.clone(), DownlinkCommandHandler::new(shared))
    }

    #[tokio::test]
    async fn test_pull_resp_reaches_handler() {
        let link = link(0x260B1234).await;
        let (shared, handler) = shared();

        let phy = FrameBuilder::new_downlink(0x260B1234, 1, 1, vec![0, 10]).build();
        handle_pull_resp(&link, &pull_resp_json(&phy), &handler).unwrap();

        assert_eq!(shared.duty.base_period_ms(), 600_000);
    }

    #[tokio::test]
    async fn test_pull_resp_for_other_device_ignored() {
        let link = link(0x260B1234).await;
        let (shared, handler) = shared();

        let phy = FrameBuilder::new_downlink(0x01020304, 1, 1, vec![0, 10]).build();
        handle_pull_resp(&link, &pull_resp_json(&phy), &handler).unwrap();

        assert_eq!(shared.duty.base_period_ms(), DutyCycleConfig::default().base_period_ms);
    }

    #[tokio::test]
    async fn test_pull_resp_garbage_is_error() {
        let link = link(0x260B1234).await;
        let (_shared, handler) = shared();

        assert!(handle_pull_resp(&link, "{}", &handler).is_err());
        let bad_b64 = r#"{"txpk":{"freq":869.5,"rfch":0,"powe":14,"modu":"LORA","datr":"SF9BW125","codr":"4/5","size":2,"data":"!!"}}"#;
        assert!(handle_pull_resp(&link, bad_b64, &handler).is_err());
    }

    #[test]
    fn test_gateway_eui_embeds_dev_addr() {
        assert_eq!(
            gateway_eui(0x260B1234),
            [0xFE, 0xFF, 0x52, 0x47, 0x26, 0x0B, 0x12, 0x34]
        );
    }

    #[tokio::test]
    async fn test_send_pushes_uplink_to_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = NetworkConfig {
            server: server.local_addr().unwrap().to_string(),
            bind: "127.0.0.1:0".to_string(),
            join_attempts: 1,
            keepalive_secs: 3600,
        };
        let (_shared, handler) = shared();
        let mut stack = GwmpStack::start(&config, 0x260B1234, 2, handler, Arc::new(Notify::new()))
            .await
            .unwrap();

        assert!(stack.send(&[1, 2, 3]).await.is_err());
        stack.init(DeviceClass::A, Region::US915).await;
        stack.join().await;
        assert!(stack.is_joined());
        stack.send(&[0x0F, 0x00, 0x01]).await.unwrap();

        // The keepalive fires immediately; skip to the PUSH_DATA
        let mut buf = [0u8; 2048];
        let rxpk = loop {
            let (len, _) = server.recv_from(&mut buf).await.unwrap();
            if let GwmpPacket::PushData { json_payload, .. } = GwmpPacket::parse(&buf[..len]).unwrap() {
                let body: PushDataPayload = serde_json::from_str(&json_payload).unwrap();
                break body.rxpk.unwrap().remove(0);
            }
        };

        assert!((rxpk.freq - 902.3).abs() < 1e-6);
        let phy = base64::engine::general_purpose::STANDARD.decode(&rxpk.data).unwrap();
        let LoRaWANFrame::Data(frame) = lorawan::decode_phy_payload(&phy).unwrap() else {
            panic!("Expected Data frame");
        };
        assert_eq!(frame.dev_addr, 0x260B1234);
        assert_eq!(frame.f_port, Some(2));
        assert_eq!(frame.fcnt, 0);
        assert_eq!(frame.frm_payload, vec![0x0F, 0x00, 0x01]);
    }
}
