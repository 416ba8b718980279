/// Telemetry snapshot for a simulated driver, used to check resource balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverTelemetry {
    /// Successful allocations since the driver was created.
    pub allocations: u64,
    /// Successful frees since the driver was created.
    pub frees: u64,
    /// Allocations currently live across all devices.
    pub live_allocations: u64,
    /// Bytes moved host to device.
    pub bytes_h2d: u64,
    /// Bytes moved device to host.
    pub bytes_d2h: u64,
    /// Bytes moved within a device.
    pub bytes_d2d: u64,
    /// Chunk events processed by the engine.
    pub events: u64,
}

impl DriverTelemetry {
    /// Panics if any allocation leaked or was freed twice.
    pub fn assert_balanced(&self) {
        assert_eq!(
            self.allocations, self.frees,
            "allocations ({}) != frees ({})",
            self.allocations, self.frees,
        );
        assert_eq!(
            self.live_allocations, 0,
            "live_allocations was {}, expected 0",
            self.live_allocations,
        );
    }
}
