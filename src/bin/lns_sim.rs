//! Network Server Simulator
//!
//! Stands in for a LoRaWAN network server behind a Semtech UDP packet
//! forwarder. ACKs everything, decodes rain reports from the node, and can
//! push one update-interval downlink.
//!
//! Usage:
//!   cargo run --bin lns-sim
//!   cargo run --bin lns-sim -- --bind 0.0.0.0:1680 --interval 0:10

use std::net::SocketAddr;

use base64::Engine;
use clap::Parser;
use tokio::net::UdpSocket;

use rain_gauge_node::downlink::INTERVAL_PORT;
use rain_gauge_node::gwmp::protocol::{GwmpPacket, PullRespPayload, PushDataPayload, Txpk};
use rain_gauge_node::lorawan::encoder::FrameBuilder;
use rain_gauge_node::lorawan::{decode_phy_payload, LoRaWANFrame};
use rain_gauge_node::payload::decode_report;

/// Each tip is 0.2794 mm (0.011") of rain
const MM_PER_TIP: f32 = 0.2794;

#[derive(Parser)]
#[command(name = "lns-sim")]
#[command(about = "Minimal GWMP network server for the rain gauge node")]
struct Cli {
    /// UDP address to listen on
    #[arg(short, long, default_value = "0.0.0.0:1680")]
    bind: SocketAddr,

    /// Send an update-interval downlink, as HOURS:MINUTES
    #[arg(long, value_parser = parse_interval)]
    interval: Option<(u8, u8)>,
}

fn parse_interval(s: &str) -> Result<(u8, u8), String> {
    let (hours, minutes) = s
        .split_once(':')
        .ok_or_else(|| format!("expected HOURS:MINUTES, got '{}'", s))?;
    let hours = hours.parse::<u8>().map_err(|e| format!("hours: {}", e))?;
    let minutes = minutes.parse::<u8>().map_err(|e| format!("minutes: {}", e))?;
    Ok((hours, minutes))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    println!("🌧️  Rain gauge LNS simulator");
    println!("  Listening: {}", cli.bind);
    if let Some((h, m)) = cli.interval {
        println!("  Pending downlink: interval {}h {}min", h, m);
    }
    println!();

    let socket = UdpSocket::bind(cli.bind).await?;
    let mut pending_interval = cli.interval;
    let mut last_dev_addr: Option<u32> = None;
    let mut fcnt_down: u16 = 0;
    let mut buf = vec![0u8; 65535];

    loop {
        let (len, src) = socket.recv_from(&mut buf).await?;

        let packet = match GwmpPacket::parse(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                println!("⚠️  Bad packet from {}: {}", src, e);
                continue;
            }
        };

        match packet {
            GwmpPacket::PushData {
                random_token,
                gateway_eui,
                json_payload,
            } => {
                socket
                    .send_to(&GwmpPacket::PushAck { random_token }.encode(), src)
                    .await?;

                let body: PushDataPayload = match serde_json::from_str(&json_payload) {
                    Ok(body) => body,
                    Err(e) => {
                        println!("⚠️  Bad PUSH_DATA JSON: {}", e);
                        continue;
                    }
                };
                for rxpk in body.rxpk.unwrap_or_default() {
                    if let Some(dev_addr) = print_uplink(&hex::encode(gateway_eui), &rxpk.data) {
                        last_dev_addr = Some(dev_addr);
                    }
                }
            }
            GwmpPacket::PullData {
                random_token,
                gateway_eui,
            } => {
                socket
                    .send_to(&GwmpPacket::PullAck { random_token }.encode(), src)
                    .await?;

                // Downlinks need the node's DevAddr, so wait for an uplink first
                let (Some((hours, minutes)), Some(dev_addr)) = (pending_interval, last_dev_addr) else {
                    continue;
                };

                let phy = FrameBuilder::new_downlink(dev_addr, fcnt_down, INTERVAL_PORT, vec![hours, minutes])
                    .build();
                fcnt_down = fcnt_down.wrapping_add(1);

                let resp = PullRespPayload {
                    txpk: build_txpk(&phy),
                };
                let packet = GwmpPacket::PullResp {
                    random_token: random_token.wrapping_add(1),
                    json_payload: serde_json::to_string(&resp)?,
                };
                socket.send_to(&packet.encode(), src).await?;

                println!(
                    "📤 Downlink to {:08X} via {}: interval {}h {}min",
                    dev_addr,
                    hex::encode(gateway_eui),
                    hours,
                    minutes
                );
                pending_interval = None;
            }
            GwmpPacket::TxAck { json_payload, .. } => match json_payload {
                Some(json) => println!("   TX_ACK: {}", json),
                None => println!("   ✅ TX_ACK"),
            },
            other => {
                println!("   Unexpected {:?} from {}", other.packet_type(), src);
            }
        }
    }
}

/// Decode and print one uplink; returns its DevAddr
fn print_uplink(gateway: &str, data_b64: &str) -> Option<u32> {
    let phy = match base64::engine::general_purpose::STANDARD.decode(data_b64) {
        Ok(phy) => phy,
        Err(e) => {
            println!("⚠️  Bad rxpk data: {}", e);
            return None;
        }
    };

    let frame = match decode_phy_payload(&phy) {
        Ok(LoRaWANFrame::Data(frame)) => frame,
        Ok(other) => {
            println!("📡 {} via {}", other, gateway);
            return None;
        }
        Err(e) => {
            println!("⚠️  Undecodable frame: {}", e);
            return None;
        }
    };

    println!(
        "📡 {} DevAddr={:08X} FCnt={} via {}",
        frame.mtype, frame.dev_addr, frame.fcnt, gateway
    );
    match decode_report(&frame.frm_payload) {
        Ok(report) => {
            let tips = report.tips.unwrap_or(0);
            println!(
                "   🌧️  {} tip(s) = {:.2} mm, battery {:.2} V",
                tips,
                tips as f32 * MM_PER_TIP,
                report.battery_volts.unwrap_or(0.0)
            );
        }
        Err(e) => println!("   ⚠️  Not a rain report: {}", e),
    }

    Some(frame.dev_addr)
}

/// Immediate RX2 transmit request
fn build_txpk(phy: &[u8]) -> Txpk {
    Txpk {
        imme: true,
        tmst: None,
        freq: 869.525,
        rfch: 0,
        powe: 14,
        modu: "LORA".to_string(),
        datr: "SF9BW125".to_string(),
        codr: "4/5".to_string(),
        ipol: true,
        size: phy.len() as u16,
        data: base64::engine::general_purpose::STANDARD.encode(phy),
    }
}
