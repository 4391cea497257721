use crate::models::{
    AdapterState, ConnectionState, DenialReason, PeripheralHandle, ScanState, StreamSample,
};

/// Notifications the core publishes for the UI layer.
#[derive(Clone, Debug, PartialEq)]
pub enum SensorEvent {
    DeviceListUpdated {
        devices: Vec<PeripheralHandle>,
    },
    ScanStateChanged {
        state: ScanState,
    },
    ScanFailed {
        reason: String,
    },
    /// `failure` names the target device when `state` is `Failed`.
    ConnectionStateChanged {
        device: PeripheralHandle,
        state: ConnectionState,
        failure: Option<String>,
    },
    StreamSampleUpdated {
        sample: StreamSample,
    },
    StreamEnded {
        device: PeripheralHandle,
    },
    PermissionDenied {
        reason: DenialReason,
    },
    RadioNotReady {
        state: AdapterState,
    },
    AdapterStateChanged {
        state: AdapterState,
    },
}
