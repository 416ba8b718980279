//! Core type definitions: DeviceId, DevicePtr, MemoryMode, Direction, SimTime.

use std::ops::Sub;
use std::str::FromStr;

/// Identifier of one simulated device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gpu{}", self.0)
    }
}

impl FromStr for DeviceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(DeviceId)
    }
}

/// Opaque reference to a device allocation.
///
/// The address is only meaningful to the driver that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl std::fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How the driver is asked to back an allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    /// Plain device memory.
    #[default]
    Device,
    /// Host and device share one address space.
    Unified,
}

impl std::fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryMode::Device => write!(f, "device"),
            MemoryMode::Unified => write!(f, "unified"),
        }
    }
}

/// Copy direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::HostToDevice => write!(f, "H2D"),
            Direction::DeviceToHost => write!(f, "D2H"),
            Direction::DeviceToDevice => write!(f, "D2D"),
        }
    }
}

/// A reading of the simulated clock, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd)]
pub struct SimTime(pub f64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0.0);

    pub fn as_secs(self) -> f64 {
        self.0
    }

    /// Time advanced by `secs` seconds.
    pub fn after(self, secs: f64) -> SimTime {
        SimTime(self.0 + secs)
    }

    /// Elapsed seconds since `earlier`, clamped at zero.
    pub fn since(self, earlier: SimTime) -> f64 {
        (self.0 - earlier.0).max(0.0)
    }
}

impl Sub for SimTime {
    type Output = f64;

    fn sub(self, rhs: SimTime) -> f64 {
        self.0 - rhs.0
    }
}

impl std::fmt::Display for SimTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.9}s", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_parse() {
        assert_eq!(" 3".parse::<DeviceId>().unwrap(), DeviceId(3));
        assert!("x".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_sim_time_since_clamps() {
        let a = SimTime(2.0);
        let b = SimTime(1.5);
        assert_eq!(a.since(b), 0.5);
        assert_eq!(b.since(a), 0.0);
        assert_eq!(a - b, 0.5);
    }

    #[test]
    fn test_display() {
        assert_eq!(DeviceId(1).to_string(), "gpu1");
        assert_eq!(DevicePtr(4096).to_string(), "0x1000");
        assert_eq!(Direction::HostToDevice.to_string(), "H2D");
        assert_eq!(MemoryMode::default(), MemoryMode::Device);
    }
}
