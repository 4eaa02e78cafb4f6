//! Ecotracker energy monitor integration
//!
//! This library polls an Ecotracker device over its local HTTP JSON endpoint and
//! republishes power and imported/exported energy as sensor entities, with
//! config and options flows for adding a device and changing its interval.

pub mod config;
pub mod coordinator;
pub mod device_client;
pub mod error;
pub mod integration;
pub mod sensor;
pub mod setup_flow;

#[cfg(test)]
mod test_support;

// Re-export commonly used types for easier access
pub use config::{ConfigEntry, ConfigStore, JsonFileConfigStore, MemoryConfigStore, PollingConfig};
pub use coordinator::{Coordinator, CoordinatorState};
pub use device_client::{DeviceClient, DeviceReading, EcotrackerClient};
pub use error::{EcotrackerError, Result};
pub use integration::Integration;
pub use sensor::{EcotrackerSensor, LogSink, SensorKind, SensorSink, SensorState};
pub use setup_flow::{ConfigFlow, FlowResult, OptionsFlow};
