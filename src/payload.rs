//! Report payload encoding (Cayenne LPP)
//!
//! Layout, 7 bytes total:
//!   15 | 0x00 | tips(1)            Digital Input, rain tips since last report
//!    8 | 0x02 | volts*100(2, BE)   Analog Input, battery voltage

use bytes::{Buf, BufMut};

/// Size of the node's LPP buffer
pub const MAX_PAYLOAD_LEN: usize = 8;

pub const RAIN_CHANNEL: u8 = 15;
pub const BATTERY_CHANNEL: u8 = 8;

const LPP_DIGITAL_INPUT: u8 = 0x00;
const LPP_ANALOG_INPUT: u8 = 0x02;

/// Builds the uplink body from the two report fields
pub trait PayloadEncoder {
    /// Largest tip count one report can carry
    fn max_tips(&self) -> u32 {
        u32::MAX
    }

    fn encode(&self, tip_count: u32, battery_mv: u32) -> Vec<u8>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CayenneLpp;

impl PayloadEncoder for CayenneLpp {
    fn max_tips(&self) -> u32 {
        u8::MAX as u32
    }

    fn encode(&self, tip_count: u32, battery_mv: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_PAYLOAD_LEN);

        // Digital input holds one byte; callers drain at most `max_tips`
        buf.put_u8(RAIN_CHANNEL);
        buf.put_u8(LPP_DIGITAL_INPUT);
        buf.put_u8(tip_count.min(self.max_tips()) as u8);

        // Analog input: volts with 0.01 resolution, i.e. mV / 10
        let centivolts = (battery_mv / 10).min(i16::MAX as u32) as i16;
        buf.put_u8(BATTERY_CHANNEL);
        buf.put_u8(LPP_ANALOG_INPUT);
        buf.put_i16(centivolts);

        buf
    }
}

/// A decoded rain report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RainReport {
    pub tips: Option<u8>,
    pub battery_volts: Option<f32>,
}

/// Decode the digital/analog input channels of a Cayenne LPP payload
pub fn decode_report(data: &[u8]) -> anyhow::Result<RainReport> {
    let mut buf = data;
    let mut report = RainReport::default();

    while buf.has_remaining() {
        if buf.remaining() < 2 {
            return Err(anyhow::anyhow!("Truncated LPP header"));
        }
        let channel = buf.get_u8();
        let kind = buf.get_u8();

        match kind {
            LPP_DIGITAL_INPUT => {
                if buf.remaining() < 1 {
                    return Err(anyhow::anyhow!("Truncated digital input on channel {}", channel));
                }
                let value = buf.get_u8();
                if channel == RAIN_CHANNEL {
                    report.tips = Some(value);
                }
            }
            LPP_ANALOG_INPUT => {
                if buf.remaining() < 2 {
                    return Err(anyhow::anyhow!("Truncated analog input on channel {}", channel));
                }
                let value = buf.get_i16() as f32 / 100.0;
                if channel == BATTERY_CHANNEL {
                    report.battery_volts = Some(value);
                }
            }
            other => {
                return Err(anyhow::anyhow!(
                    "Unsupported LPP type 0x{:02x} on channel {}",
                    other,
                    channel
                ))
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let payload = CayenneLpp.encode(12, 3_700);
        assert_eq!(payload, vec![0x0F, 0x00, 0x0C, 0x08, 0x02, 0x01, 0x72]);
        assert!(payload.len() <= MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_tips_saturate_at_one_byte() {
        let payload = CayenneLpp.encode(1_000, 3_300);
        assert_eq!(payload[2], 0xFF);
    }

    #[test]
    fn test_decode_report() {
        let report = decode_report(&CayenneLpp.encode(7, 4_150)).unwrap();
        assert_eq!(report.tips, Some(7));
        let volts = report.battery_volts.unwrap();
        assert!((volts - 4.15).abs() < 0.001);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        assert!(decode_report(&[0x0F, 0x00]).is_err());
        assert!(decode_report(&[0x08, 0x02, 0x01]).is_err());
        assert!(decode_report(&[0x0F]).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        // 0x67 is LPP temperature, not produced by this node
        assert!(decode_report(&[0x01, 0x67, 0x00, 0xE1]).is_err());
    }
}
