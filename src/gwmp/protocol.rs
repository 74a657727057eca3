//! Semtech UDP Packet Forwarder Protocol (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! The protocol uses a simple binary header followed by JSON payload.
//! All multi-byte integers are big-endian (network byte order).
//!
//! The node emulator plays the gateway side (PUSH_DATA, PULL_DATA, TX_ACK
//! out; PUSH_ACK, PULL_ACK, PULL_RESP in); `lns-sim` plays the server side.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Protocol version (always 0x02)
pub const PROTOCOL_VERSION: u8 = 0x02;

/// Packet types (identifier byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    PushData = 0x00,
    PushAck = 0x01,
    PullData = 0x02,
    PullResp = 0x03,
    PullAck = 0x04,
    TxAck = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(PacketType::PushData),
            0x01 => Ok(PacketType::PushAck),
            0x02 => Ok(PacketType::PullData),
            0x03 => Ok(PacketType::PullResp),
            0x04 => Ok(PacketType::PullAck),
            0x05 => Ok(PacketType::TxAck),
            _ => Err(anyhow::anyhow!("Unknown packet type: 0x{:02x}", value)),
        }
    }
}

/// Gateway identifier (EUI-64, 8 bytes)
pub type GatewayEui = [u8; 8];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GwmpPacket {
    PushData {
        random_token: u16,
        gateway_eui: GatewayEui,
        json_payload: String,
    },
    PushAck {
        random_token: u16,
    },
    PullData {
        random_token: u16,
        gateway_eui: GatewayEui,
    },
    PullResp {
        random_token: u16,
        json_payload: String,
    },
    PullAck {
        random_token: u16,
    },
    TxAck {
        random_token: u16,
        gateway_eui: GatewayEui,
        json_payload: Option<String>,
    },
}

/// Received packet record, as the node reports its own uplinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// UTC time of packet reception
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// Concentrator timestamp (microseconds)
    pub tmst: u32,
    pub chan: u8,
    pub rfch: u8,
    /// Frequency in MHz
    pub freq: f64,
    /// CRC status: 1 = OK
    pub stat: i8,
    pub modu: String,
    /// LoRa datarate identifier (e.g., "SF7BW125")
    pub datr: String,
    pub codr: String,
    /// RSSI in dBm
    pub rssi: f64,
    /// LoRa signal-to-noise ratio
    pub lsnr: f64,
    /// RF packet payload size in bytes
    pub size: u16,
    /// Base64 encoded RF packet payload
    pub data: String,
}

/// Transmit request from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring tmst
    #[serde(default)]
    pub imme: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    pub freq: f64,
    pub rfch: u8,
    pub powe: u8,
    pub modu: String,
    pub datr: String,
    pub codr: String,
    /// Polarity inversion; true for LoRaWAN downlinks
    #[serde(default)]
    pub ipol: bool,
    pub size: u16,
    pub data: String,
}

/// PUSH_DATA JSON body
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PushDataPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rxpk: Option<Vec<Rxpk>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<serde_json::Value>,
}

/// PULL_RESP JSON body
#[derive(Debug, Serialize, Deserialize)]
pub struct PullRespPayload {
    pub txpk: Txpk,
}

impl GwmpPacket {
    /// Parse a raw UDP datagram into a GWMP packet
    pub fn parse(data: &[u8]) -> anyhow::Result<Self> {
        if data.len() < 4 {
            return Err(anyhow::anyhow!("Packet too short: {} bytes", data.len()));
        }

        let mut buf = data;

        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(anyhow::anyhow!(
                "Unsupported protocol version: 0x{:02x}",
                version
            ));
        }

        let random_token = buf.get_u16();
        let packet_type = PacketType::try_from(buf.get_u8())?;

        match packet_type {
            PacketType::PushData => {
                let gateway_eui = read_eui(&mut buf, "PUSH_DATA")?;
                Ok(GwmpPacket::PushData {
                    random_token,
                    gateway_eui,
                    json_payload: read_json(buf)?,
                })
            }
            PacketType::PushAck => Ok(GwmpPacket::PushAck { random_token }),
            PacketType::PullData => {
                let gateway_eui = read_eui(&mut buf, "PULL_DATA")?;
                Ok(GwmpPacket::PullData {
                    random_token,
                    gateway_eui,
                })
            }
            PacketType::PullResp => Ok(GwmpPacket::PullResp {
                random_token,
                json_payload: read_json(buf)?,
            }),
            PacketType::PullAck => Ok(GwmpPacket::PullAck { random_token }),
            PacketType::TxAck => {
                let gateway_eui = read_eui(&mut buf, "TX_ACK")?;
                let json_payload = if buf.has_remaining() {
                    Some(read_json(buf)?)
                } else {
                    None
                };
                Ok(GwmpPacket::TxAck {
                    random_token,
                    gateway_eui,
                    json_payload,
                })
            }
        }
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            GwmpPacket::PushData { .. } => PacketType::PushData,
            GwmpPacket::PushAck { .. } => PacketType::PushAck,
            GwmpPacket::PullData { .. } => PacketType::PullData,
            GwmpPacket::PullResp { .. } => PacketType::PullResp,
            GwmpPacket::PullAck { .. } => PacketType::PullAck,
            GwmpPacket::TxAck { .. } => PacketType::TxAck,
        }
    }

    /// Serialise for the wire
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u8(PROTOCOL_VERSION);

        match self {
            GwmpPacket::PushData {
                random_token,
                gateway_eui,
                json_payload,
            } => {
                put_header(&mut buf, *random_token, self.packet_type());
                buf.put_slice(gateway_eui);
                buf.put_slice(json_payload.as_bytes());
            }
            GwmpPacket::PullData {
                random_token,
                gateway_eui,
            } => {
                put_header(&mut buf, *random_token, self.packet_type());
                buf.put_slice(gateway_eui);
            }
            GwmpPacket::PullResp {
                random_token,
                json_payload,
            } => {
                put_header(&mut buf, *random_token, self.packet_type());
                buf.put_slice(json_payload.as_bytes());
            }
            GwmpPacket::TxAck {
                random_token,
                gateway_eui,
                json_payload,
            } => {
                put_header(&mut buf, *random_token, self.packet_type());
                buf.put_slice(gateway_eui);
                if let Some(json) = json_payload {
                    buf.put_slice(json.as_bytes());
                }
            }
            GwmpPacket::PushAck { random_token } | GwmpPacket::PullAck { random_token } => {
                put_header(&mut buf, *random_token, self.packet_type());
            }
        }

        buf.to_vec()
    }
}

fn put_header(buf: &mut BytesMut, random_token: u16, packet_type: PacketType) {
    buf.put_u16(random_token);
    buf.put_u8(packet_type as u8);
}

fn read_eui(buf: &mut &[u8], what: &str) -> anyhow::Result<GatewayEui> {
    if buf.remaining() < 8 {
        return Err(anyhow::anyhow!("{} too short for gateway EUI", what));
    }
    let mut gateway_eui = [0u8; 8];
    buf.copy_to_slice(&mut gateway_eui);
    Ok(gateway_eui)
}

fn read_json(buf: &[u8]) -> anyhow::Result<String> {
    String::from_utf8(buf.to_vec())
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 in JSON payload: {}", e))
}
