//! Sensor entities projected from the coordinator's cached reading.

use crate::coordinator::{Coordinator, CoordinatorState};
use crate::device_client::DeviceReading;
use serde_derive::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub const MANUFACTURER: &str = "Ecotracker";
pub const MODEL: &str = "Energy Monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Power,
    EnergyIn,
    EnergyOut,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [SensorKind::Power, SensorKind::EnergyIn, SensorKind::EnergyOut];

    pub fn key(self) -> &'static str {
        match self {
            SensorKind::Power => "power",
            SensorKind::EnergyIn => "energy_in",
            SensorKind::EnergyOut => "energy_out",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorKind::Power => "Power",
            SensorKind::EnergyIn => "Energy In",
            SensorKind::EnergyOut => "Energy Out",
        }
    }

    pub fn unit(self) -> Unit {
        match self {
            SensorKind::Power => Unit::Watt,
            SensorKind::EnergyIn | SensorKind::EnergyOut => Unit::KiloWattHour,
        }
    }

    pub fn device_class(self) -> DeviceClass {
        match self {
            SensorKind::Power => DeviceClass::Power,
            SensorKind::EnergyIn | SensorKind::EnergyOut => DeviceClass::Energy,
        }
    }

    pub fn state_class(self) -> StateClass {
        match self {
            SensorKind::Power => StateClass::Measurement,
            SensorKind::EnergyIn | SensorKind::EnergyOut => StateClass::TotalIncreasing,
        }
    }

    pub fn value_of(self, reading: &DeviceReading) -> f64 {
        match self {
            SensorKind::Power => reading.power_w,
            SensorKind::EnergyIn => reading.energy_in_kwh,
            SensorKind::EnergyOut => reading.energy_out_kwh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Unit {
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "kWh")]
    KiloWattHour,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Watt => write!(f, "W"),
            Unit::KiloWattHour => write!(f, "kWh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Power,
    Energy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

/// Device registry record shared by the three entities of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

/// What the host's entity framework receives on every update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    pub unique_id: String,
    pub name: String,
    pub value: Option<f64>,
    pub unit: Unit,
    pub device_class: DeviceClass,
    pub state_class: StateClass,
    pub available: bool,
}

/// Host-side entity update API.
pub trait SensorSink: Send + Sync {
    fn publish(&self, state: &SensorState);
}

/// Sink that writes every update to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl SensorSink for LogSink {
    fn publish(&self, state: &SensorState) {
        match state.value {
            Some(value) if state.available => info!(
                entity = %state.unique_id,
                value,
                unit = %state.unit,
                "{}: {value} {}",
                state.name,
                state.unit
            ),
            _ => info!(entity = %state.unique_id, "{}: unavailable", state.name),
        }
    }
}

#[derive(Clone)]
pub struct EcotrackerSensor {
    kind: SensorKind,
    entry_id: String,
    coordinator: Arc<Coordinator>,
}

impl EcotrackerSensor {
    pub fn new(kind: SensorKind, entry_id: impl Into<String>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            kind,
            entry_id: entry_id.into(),
            coordinator,
        }
    }

    /// Power, energy-in and energy-out sensors for one config entry.
    pub fn for_entry(entry_id: &str, coordinator: &Arc<Coordinator>) -> Vec<Self> {
        SensorKind::ALL
            .into_iter()
            .map(|kind| Self::new(kind, entry_id, Arc::clone(coordinator)))
            .collect()
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn unique_id(&self) -> String {
        format!("{}_{}", self.entry_id, self.kind.key())
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            identifier: self.entry_id.clone(),
            name: MANUFACTURER.to_string(),
            manufacturer: MANUFACTURER.to_string(),
            model: MODEL.to_string(),
        }
    }

    /// Unavailable only until the first successful fetch.
    pub fn available(&self) -> bool {
        self.coordinator.current_reading().is_some()
    }

    pub fn native_value(&self) -> Option<f64> {
        self.coordinator
            .current_reading()
            .map(|reading| self.kind.value_of(&reading))
    }

    pub fn state(&self) -> SensorState {
        self.render(&self.coordinator.state())
    }

    fn render(&self, state: &CoordinatorState) -> SensorState {
        let value = state.reading.as_ref().map(|r| self.kind.value_of(r));
        SensorState {
            unique_id: self.unique_id(),
            name: self.kind.name().to_string(),
            value,
            unit: self.kind.unit(),
            device_class: self.kind.device_class(),
            state_class: self.kind.state_class(),
            available: value.is_some(),
        }
    }

    /// Publishes the current state, then re-renders on every coordinator update.
    pub fn spawn(self, sink: Arc<dyn SensorSink>) -> JoinHandle<()> {
        let mut updates = self.coordinator.subscribe();
        let initial = self.render(&updates.borrow_and_update());
        sink.publish(&initial);
        tokio::spawn(self.run(updates, sink))
    }

    async fn run(self, mut updates: watch::Receiver<CoordinatorState>, sink: Arc<dyn SensorSink>) {
        while updates.changed().await.is_ok() {
            let state = self.render(&updates.borrow_and_update());
            sink.publish(&state);
        }
    }
}
