//! LoRaWAN data frame encoder
//!
//! Frame structure:
//!   MHDR(1) | DevAddr(4,LE) | FCtrl(1) | FCnt(2,LE) | [FPort(1) | FRMPayload(N)] | MIC(4,LE)
//!
//! FRMPayload is sent in the clear and the MIC is zero: the emulator has no
//! session keys, and the network servers it talks to are run with MIC
//! checks disabled.

use bytes::BufMut;

use super::{FCtrl, MType};

#[derive(Debug, Clone)]
pub struct FrameBuilder {
    pub mtype: MType,
    pub dev_addr: u32,
    pub fctrl: FCtrl,
    /// Frame counter (16-bit, managed by caller)
    pub fcnt: u16,
    /// Application port, 1-223
    pub f_port: u8,
    pub payload: Vec<u8>,
}

impl FrameBuilder {
    /// Unconfirmed uplink from the node
    pub fn new_uplink(dev_addr: u32, fcnt: u16, f_port: u8, payload: Vec<u8>) -> Self {
        Self {
            mtype: MType::UnconfirmedDataUp,
            dev_addr,
            fctrl: FCtrl::default(),
            fcnt,
            f_port,
            payload,
        }
    }

    /// Unconfirmed downlink to the node
    pub fn new_downlink(dev_addr: u32, fcnt: u16, f_port: u8, payload: Vec<u8>) -> Self {
        Self {
            mtype: MType::UnconfirmedDataDown,
            ..Self::new_uplink(dev_addr, fcnt, f_port, payload)
        }
    }

    /// Build the raw PHY payload, ready for base64 encoding into rxpk/txpk `data`
    pub fn build(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(13 + self.payload.len());

        frame.put_u8(self.mtype.mhdr());
        frame.put_u32_le(self.dev_addr);
        frame.put_u8(FCtrl { f_opts_len: 0, ..self.fctrl }.into());
        frame.put_u16_le(self.fcnt);

        // FPort only travels with a payload
        if !self.payload.is_empty() {
            frame.put_u8(self.f_port);
            frame.put_slice(&self.payload);
        }

        frame.put_u32_le(0);
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::{decode_phy_payload, LoRaWANFrame};

    #[test]
    fn test_build_uplink_report() {
        let report = vec![0x0F, 0x00, 0x03, 0x08, 0x02, 0x01, 0x72];
        let frame = FrameBuilder::new_uplink(0x260B1234, 42, 2, report.clone()).build();

        // MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + FPort(1) + Payload(7) + MIC(4) = 20
        assert_eq!(frame.len(), 20);
        assert_eq!(frame[0], 0x40);
        assert_eq!(&frame[1..5], &0x260B1234u32.to_le_bytes());
        assert_eq!(frame[5], 0x00);
        assert_eq!(&frame[6..8], &42u16.to_le_bytes());
        assert_eq!(frame[8], 2);
        assert_eq!(&frame[9..16], report.as_slice());
        assert_eq!(&frame[16..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_empty_payload_omits_fport() {
        let frame = FrameBuilder::new_downlink(0x12345678, 0, 1, vec![]).build();
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[0], 0x60);
    }

    #[test]
    fn test_interval_downlink_decodes() {
        let mut builder = FrameBuilder::new_downlink(0x260B1234, 9, 1, vec![1, 30]);
        builder.fctrl.ack = true;

        match decode_phy_payload(&builder.build()).unwrap() {
            LoRaWANFrame::Data(frame) => {
                assert_eq!(frame.mtype, MType::UnconfirmedDataDown);
                assert!(frame.fctrl.ack);
                assert_eq!(frame.fcnt, 9);
                assert_eq!(frame.f_port, Some(1));
                assert_eq!(frame.frm_payload, vec![1, 30]);
            }
            other => panic!("Expected Data frame, got {}", other),
        }
    }
}
