//! Collaborator interfaces consumed by the lifecycle core
//!
//! The radio stack, battery ADC and time source sit behind these traits so
//! the state machine runs unchanged against hardware, the GWMP host stack
//! or a test mock.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::time::Instant;

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    A,
    C,
}

impl FromStr for DeviceClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(DeviceClass::A),
            "C" => Ok(DeviceClass::C),
            "B" => Err(anyhow::anyhow!("Class B is not supported")),
            other => Err(anyhow::anyhow!("Unknown device class: {}", other)),
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::A => write!(f, "Class A"),
            DeviceClass::C => write!(f, "Class C"),
        }
    }
}

/// LoRaWAN regional parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    AS923,
    AU915,
    CN470,
    CN779,
    EU433,
    EU868,
    KR920,
    IN865,
    US915,
}

impl Region {
    /// First default uplink channel, in MHz
    pub fn uplink_freq_mhz(&self) -> f64 {
        match self {
            Region::AS923 => 923.2,
            Region::AU915 => 915.2,
            Region::CN470 => 470.3,
            Region::CN779 => 779.5,
            Region::EU433 => 433.175,
            Region::EU868 => 868.1,
            Region::KR920 => 922.1,
            Region::IN865 => 865.0625,
            Region::US915 => 902.3,
        }
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AS923" => Ok(Region::AS923),
            "AU915" => Ok(Region::AU915),
            "CN470" => Ok(Region::CN470),
            "CN779" => Ok(Region::CN779),
            "EU433" => Ok(Region::EU433),
            "EU868" => Ok(Region::EU868),
            "KR920" => Ok(Region::KR920),
            "IN865" => Ok(Region::IN865),
            "US915" => Ok(Region::US915),
            other => Err(anyhow::anyhow!("Unknown LoRaWAN region: {}", other)),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why `NetworkStack::sleep` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// The scheduled cycle delay expired
    Timer,
    /// A tip edge arrived first
    Edge,
}

/// The LoRaWAN stack. Join, acknowledgment, retransmission and channel
/// management all live behind this trait.
///
/// Implementations must forward every received downlink to
/// `DownlinkCommandHandler::on_message`, from whatever context they
/// receive on.
#[allow(async_fn_in_trait)]
pub trait NetworkStack {
    async fn init(&mut self, class: DeviceClass, region: Region);

    /// Retry-safe; called every iteration until `is_joined` reports true.
    async fn join(&mut self);

    fn is_joined(&self) -> bool;

    async fn send(&mut self, payload: &[u8]) -> anyhow::Result<()>;

    /// Schedule the next wake-up `delay_ms` from now.
    fn cycle(&mut self, delay_ms: u32);

    /// Suspend until the scheduled wake-up or the next tip edge.
    async fn sleep(&mut self) -> WakeReason;
}

pub trait BatteryReader {
    fn millivolts(&mut self) -> u32;
}

/// Battery that always reads the same voltage
#[derive(Debug, Clone, Copy)]
pub struct FixedBattery(pub u32);

impl BatteryReader for FixedBattery {
    fn millivolts(&mut self) -> u32 {
        self.0
    }
}

/// Monotonic millisecond time source for the main loop
#[allow(async_fn_in_trait)]
pub trait Clock {
    fn now_ms(&self) -> u64;

    /// Main-loop wait. Never called from the edge context.
    async fn delay_ms(&self, ms: u64);
}

/// Clock backed by the tokio timer, counting from construction
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    async fn delay_ms(&self, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_class() {
        assert_eq!("a".parse::<DeviceClass>().unwrap(), DeviceClass::A);
        assert_eq!(" C ".parse::<DeviceClass>().unwrap(), DeviceClass::C);
        assert!("B".parse::<DeviceClass>().is_err());
        assert!("Z".parse::<DeviceClass>().is_err());
    }

    #[test]
    fn test_parse_region() {
        assert_eq!("eu868".parse::<Region>().unwrap(), Region::EU868);
        assert_eq!("US915".parse::<Region>().unwrap(), Region::US915);
        assert!("EU999".parse::<Region>().is_err());
    }

    #[test]
    fn test_region_display_round_trips() {
        let region = Region::AU915;
        assert_eq!(region.to_string().parse::<Region>().unwrap(), region);
    }
}
