use crate::config::{ConfigEntry, ConfigStore, PollingConfig};
use crate::coordinator::Coordinator;
use crate::device_client::DeviceClient;
use crate::error::Result;
use crate::sensor::{EcotrackerSensor, SensorSink, SensorState};
use crate::setup_flow::OptionsFlow;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// A running config entry: one coordinator and the three sensors fed by it.
pub struct Integration {
    entry_id: String,
    title: String,
    coordinator: Arc<Coordinator>,
    sensors: Vec<EcotrackerSensor>,
    listeners: Vec<JoinHandle<()>>,
}

impl Integration {
    /// Builds the coordinator for `entry`, registers the sensors with `sink`
    /// and performs the first refresh before returning.
    ///
    /// A device that is down at this point does not fail setup; the sensors
    /// simply stay unavailable until the first successful poll. An entry with
    /// an invalid address or interval is rejected before anything is spawned.
    pub async fn setup(
        entry: &ConfigEntry,
        client: Arc<dyn DeviceClient>,
        sink: Arc<dyn SensorSink>,
    ) -> Result<Self> {
        let coordinator = Coordinator::new(entry.data.clone(), client)?;
        let sensors = EcotrackerSensor::for_entry(&entry.entry_id, &coordinator);
        let listeners = sensors
            .iter()
            .cloned()
            .map(|sensor| sensor.spawn(Arc::clone(&sink)))
            .collect();

        coordinator.start().await;
        info!(entry_id = %entry.entry_id, address = %entry.data.address, "Set up Ecotracker entry");

        Ok(Self {
            entry_id: entry.entry_id.clone(),
            title: entry.title.clone(),
            coordinator,
            sensors,
            listeners,
        })
    }

    pub fn entry_id(&self) -> &str {
        &self.entry_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Live configuration, including interval changes made through options.
    pub fn config(&self) -> PollingConfig {
        self.coordinator.config()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn sensors(&self) -> &[EcotrackerSensor] {
        &self.sensors
    }

    pub fn sensor_states(&self) -> Vec<SensorState> {
        self.sensors.iter().map(EcotrackerSensor::state).collect()
    }

    /// Options flow bound to this entry's running coordinator.
    pub fn options_flow(&self, store: Arc<dyn ConfigStore>) -> OptionsFlow {
        let entry = ConfigEntry {
            entry_id: self.entry_id.clone(),
            title: self.title.clone(),
            data: self.config(),
        };
        OptionsFlow::new(entry, store).with_coordinator(Arc::clone(&self.coordinator))
    }

    /// Stops polling and detaches the sensors.
    pub fn unload(self) {
        self.coordinator.stop();
        for listener in self.listeners {
            listener.abort();
        }
        info!(entry_id = %self.entry_id, "Unloaded Ecotracker entry");
    }
}
