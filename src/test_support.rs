//! Scripted device client shared by the unit tests.

use crate::device_client::{DeviceClient, DeviceReading};
use crate::error::{EcotrackerError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

pub fn reading(power_w: f64, energy_in_kwh: f64, energy_out_kwh: f64) -> DeviceReading {
    DeviceReading {
        power_w,
        energy_in_kwh,
        energy_out_kwh,
        fetched_at: Utc::now(),
    }
}

/// Replays scripted responses, each after its own delay.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<(Duration, Result<DeviceReading>)>>,
    addresses: Mutex<Vec<String>>,
    started_at: Mutex<Vec<Instant>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(script: Vec<(Duration, Result<DeviceReading>)>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    /// Every call answers immediately with the given results, in order.
    pub fn immediate(results: Vec<Result<DeviceReading>>) -> Arc<Self> {
        Self::new(results.into_iter().map(|r| (Duration::ZERO, r)).collect())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Vec<Instant> {
        self.started_at.lock().unwrap().clone()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceClient for ScriptedClient {
    async fn fetch(&self, address: &str, _timeout: Duration) -> Result<DeviceReading> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.addresses.lock().unwrap().push(address.to_string());
        self.started_at.lock().unwrap().push(Instant::now());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        let (delay, result) = next.unwrap_or_else(|| {
            (
                Duration::ZERO,
                Err(EcotrackerError::network("no scripted response")),
            )
        });
        sleep(delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
