//! LoRaWAN PHY frame codec
//!
//! Only what a node emulator needs: build data-up frames for the uplink
//! path, decode data-down frames delivered in a PULL_RESP, and recognise
//! the other message types well enough to skip them.

pub mod encoder;

use std::fmt;

use bytes::Buf;

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    /// MHDR byte with Major = LoRaWAN R1
    pub fn mhdr(&self) -> u8 {
        let bits = match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::RejoinRequest => 0b110,
            MType::Proprietary => 0b111,
        };
        bits << 5
    }

    pub fn is_downlink(&self) -> bool {
        matches!(self, MType::UnconfirmedDataDown | MType::ConfirmedDataDown)
    }
}

impl From<u8> for MType {
    fn from(mhdr: u8) -> Self {
        match (mhdr >> 5) & 0x07 {
            0b000 => MType::JoinRequest,
            0b001 => MType::JoinAccept,
            0b010 => MType::UnconfirmedDataUp,
            0b011 => MType::UnconfirmedDataDown,
            0b100 => MType::ConfirmedDataUp,
            0b101 => MType::ConfirmedDataDown,
            0b110 => MType::RejoinRequest,
            _ => MType::Proprietary,
        }
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Frame Control byte. Bit 4 is ClassB on uplinks and FPending on downlinks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub bit4: bool,
    pub f_opts_len: u8,
}

impl From<u8> for FCtrl {
    fn from(byte: u8) -> Self {
        Self {
            adr: byte & 0x80 != 0,
            adr_ack_req: byte & 0x40 != 0,
            ack: byte & 0x20 != 0,
            bit4: byte & 0x10 != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

impl From<FCtrl> for u8 {
    fn from(fctrl: FCtrl) -> u8 {
        (fctrl.adr as u8) << 7
            | (fctrl.adr_ack_req as u8) << 6
            | (fctrl.ack as u8) << 5
            | (fctrl.bit4 as u8) << 4
            | (fctrl.f_opts_len & 0x0F)
    }
}

/// Data frame, up or down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub f_opts: Vec<u8>,
    pub f_port: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoRaWANFrame {
    Data(DataFrame),
    JoinRequest { app_eui: u64, dev_eui: u64, dev_nonce: u16 },
    /// Encrypted; not decoded further without keys
    JoinAccept { encrypted_payload: Vec<u8> },
    Proprietary { payload: Vec<u8> },
}

impl fmt::Display for LoRaWANFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoRaWANFrame::Data(frame) => write!(
                f,
                "{} DevAddr={:08X} FCnt={} FPort={} Payload={} bytes",
                frame.mtype,
                frame.dev_addr,
                frame.fcnt,
                frame.f_port.map(|p| p.to_string()).unwrap_or("-".to_string()),
                frame.frm_payload.len(),
            ),
            LoRaWANFrame::JoinRequest {
                app_eui,
                dev_eui,
                dev_nonce,
            } => write!(
                f,
                "JoinRequest AppEUI={:016X} DevEUI={:016X} DevNonce={}",
                app_eui, dev_eui, dev_nonce
            ),
            LoRaWANFrame::JoinAccept { encrypted_payload } => {
                write!(f, "JoinAccept ({} bytes)", encrypted_payload.len())
            }
            LoRaWANFrame::Proprietary { payload } => {
                write!(f, "Proprietary ({} bytes)", payload.len())
            }
        }
    }
}

/// Decode a LoRaWAN PHY payload (raw bytes after base64 decode)
pub fn decode_phy_payload(data: &[u8]) -> anyhow::Result<LoRaWANFrame> {
    let Some((&mhdr, rest)) = data.split_first() else {
        return Err(anyhow::anyhow!("Empty PHY payload"));
    };

    match MType::from(mhdr) {
        MType::JoinRequest => decode_join_request(rest),
        MType::JoinAccept => Ok(LoRaWANFrame::JoinAccept {
            encrypted_payload: rest.to_vec(),
        }),
        MType::Proprietary => Ok(LoRaWANFrame::Proprietary {
            payload: rest.to_vec(),
        }),
        MType::RejoinRequest => Err(anyhow::anyhow!("RejoinRequest not supported")),
        mtype => decode_data_frame(mtype, data).map(LoRaWANFrame::Data),
    }
}

fn decode_join_request(mut body: &[u8]) -> anyhow::Result<LoRaWANFrame> {
    // AppEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4)
    if body.len() != 22 {
        return Err(anyhow::anyhow!(
            "JoinRequest must be 23 bytes, got {}",
            body.len() + 1
        ));
    }

    Ok(LoRaWANFrame::JoinRequest {
        app_eui: body.get_u64_le(),
        dev_eui: body.get_u64_le(),
        dev_nonce: body.get_u16_le(),
    })
}

fn decode_data_frame(mtype: MType, data: &[u8]) -> anyhow::Result<DataFrame> {
    // MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4)
    if data.len() < 12 {
        return Err(anyhow::anyhow!(
            "Data frame too short: {} bytes (minimum 12)",
            data.len()
        ));
    }

    let (header, mut mic_bytes) = data.split_at(data.len() - 4);
    let mic = mic_bytes.get_u32_le();

    let mut buf = &header[1..];
    let dev_addr = buf.get_u32_le();
    let fctrl = FCtrl::from(buf.get_u8());
    let fcnt = buf.get_u16_le();

    let f_opts_len = fctrl.f_opts_len as usize;
    if f_opts_len > buf.remaining() {
        return Err(anyhow::anyhow!(
            "FOpts length {} exceeds available data",
            f_opts_len
        ));
    }
    let f_opts = buf[..f_opts_len].to_vec();
    buf.advance(f_opts_len);

    let (f_port, frm_payload) = if buf.has_remaining() {
        let f_port = buf.get_u8();
        (Some(f_port), buf.to_vec())
    } else {
        (None, vec![])
    };

    Ok(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt,
        f_opts,
        f_port,
        frm_payload,
        mic,
    })
}
