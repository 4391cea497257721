//! Tunable constants for the connectivity core.
//!
//! Durations are in seconds of wall-clock time unless noted. The GATT
//! identifiers are the only wire-level constants the core knows about.

use std::time::Duration;

use uuid::Uuid;

/// Service exposing the colour-code characteristic.
pub const DATA_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Notifiable characteristic carrying the single-byte colour code.
pub const DATA_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Standard GAP Device Name characteristic (0x2A00).
pub const DEVICE_NAME_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// First platform API level that needs the scan/connect grants instead of
/// coarse location alone.
pub const PERMISSION_API_THRESHOLD: u32 = 31;

pub const MOCK_DEVICE_ID: &str = "mock-device-1";
pub const MOCK_DEVICE_NAME: &str = "Mock Device";

#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Hard bound on one scan session.
    pub scan_duration: Duration,
    /// Bound on the secondary connection used to read a device name.
    pub name_resolution_timeout: Duration,
    /// Delay before the simulated radio reports its single device.
    pub simulated_scan_delay: Duration,
    /// Period of the simulated colour cycle.
    pub simulated_stream_interval: Duration,
    /// Hard bound on one simulated stream.
    pub simulated_stream_bound: Duration,
    pub permission_api_threshold: u32,
    pub mock_device_id: String,
    pub mock_device_name: String,
    /// Buffer of the outbound event channel.
    pub event_capacity: usize,
    /// Bound of the owner task's inbound queue.
    pub command_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_secs(10),
            name_resolution_timeout: Duration::from_secs(5),
            simulated_scan_delay: Duration::from_secs(2),
            simulated_stream_interval: Duration::from_secs(1),
            simulated_stream_bound: Duration::from_secs(30),
            permission_api_threshold: PERMISSION_API_THRESHOLD,
            mock_device_id: MOCK_DEVICE_ID.to_string(),
            mock_device_name: MOCK_DEVICE_NAME.to_string(),
            event_capacity: 64,
            command_capacity: 32,
        }
    }
}
