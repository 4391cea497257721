/// A discovered peripheral. Real and simulated radios construct the same type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralHandle {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub connectable: bool,
}

impl PeripheralHandle {
    /// Name shown to the user: the resolved name, or the identifier when none is known.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
    SimulatedOn,
}

impl AdapterState {
    /// Whether a scan may start in this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, AdapterState::PoweredOn | AdapterState::SimulatedOn)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenialReason {
    Denied,
    NotRequestable,
    PlatformNotApplicable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionResult {
    pub granted: bool,
    pub reason: Option<DenialReason>,
}

impl PermissionResult {
    pub fn granted() -> Self {
        Self {
            granted: true,
            reason: None,
        }
    }

    pub fn denied(reason: DenialReason) -> Self {
        Self {
            granted: false,
            reason: Some(reason),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
    Failed,
}

impl ConnectionState {
    /// States in which a radio link may be open and must be released on teardown.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::ServiceDiscovery | ConnectionState::Ready
        )
    }
}

/// Snapshot of the single connection session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSession {
    pub session_id: u64,
    pub peripheral: PeripheralHandle,
    pub state: ConnectionState,
    pub connect_attempt_unix_ms: i64,
    pub last_exchange_unix_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
}

/// Decoded value of the sensor's colour-code characteristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamSample {
    Red,
    Green,
    Blue,
    Idle,
}

impl StreamSample {
    pub const CYCLE: [StreamSample; 4] = [
        StreamSample::Red,
        StreamSample::Green,
        StreamSample::Blue,
        StreamSample::Idle,
    ];

    /// Total mapping from the wire byte; unknown codes read as `Idle`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => StreamSample::Red,
            0x02 => StreamSample::Green,
            0x03 => StreamSample::Blue,
            _ => StreamSample::Idle,
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            StreamSample::Red => 0x01,
            StreamSample::Green => 0x02,
            StreamSample::Blue => 0x03,
            StreamSample::Idle => 0x00,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_falls_back_to_id() {
        let mut handle = PeripheralHandle {
            id: "AA:BB".to_string(),
            name: None,
            rssi: Some(-40),
            connectable: true,
        };
        assert_eq!(handle.label(), "AA:BB");
        handle.name = Some("Sensor".to_string());
        assert_eq!(handle.label(), "Sensor");
    }

    #[test]
    fn test_adapter_ready_states() {
        assert!(AdapterState::PoweredOn.is_ready());
        assert!(AdapterState::SimulatedOn.is_ready());
        assert!(!AdapterState::PoweredOff.is_ready());
        assert!(!AdapterState::Unknown.is_ready());
        assert!(!AdapterState::Unauthorized.is_ready());
    }

    #[test]
    fn test_from_code_is_total() {
        for code in 0..=u8::MAX {
            let sample = StreamSample::from_code(code);
            match code {
                0x01 => assert_eq!(sample, StreamSample::Red),
                0x02 => assert_eq!(sample, StreamSample::Green),
                0x03 => assert_eq!(sample, StreamSample::Blue),
                _ => assert_eq!(sample, StreamSample::Idle),
            }
        }
    }

    #[test]
    fn test_cycle_codes_decode_to_themselves() {
        for sample in StreamSample::CYCLE {
            assert_eq!(StreamSample::from_code(sample.code()), sample);
        }
    }
}
