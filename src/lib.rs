pub mod adapter_state;
pub mod ble;
pub mod ble_btleplug;
pub mod ble_mock;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod events;
pub mod ffi;
pub mod models;
pub mod permissions;
pub mod scanner;
mod simulation;
pub mod stream;
mod timer;

uniffi::include_scaffolding!("sensorlink");

pub use adapter_state::{RadioMode, RadioProvider};
pub use ble::{Advertisement, BleAdapter, ScanUpdate};
pub use config::CoreConfig;
pub use engine::{CoreSnapshot, SensorLinkCore};
pub use error::{DecodeError, SensorLinkError};
pub use events::SensorEvent;
pub use ffi::{init_logging, SensorEventListener, SensorLink};
pub use models::{
    AdapterState, ConnectionSession, ConnectionState, DenialReason, PeripheralHandle,
    PermissionResult, ScanState, StreamSample,
};
pub use permissions::{Permission, PermissionPlatform, PermissionStatus};
pub use scanner::DeviceScan;
pub use stream::decode_payload;
