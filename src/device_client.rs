use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EcotrackerError, Result};

/// One successful snapshot of the device counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReading {
    pub power_w: f64,
    pub energy_in_kwh: f64,
    pub energy_out_kwh: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Fetches a reading from the device at `address`.
///
/// Implementations keep no per-device state; the coordinator and the setup
/// flow both pass the address they are working with.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn fetch(&self, address: &str, timeout: Duration) -> Result<DeviceReading>;
}

/// HTTP client for the Ecotracker local JSON endpoint.
#[derive(Debug, Clone, Default)]
pub struct EcotrackerClient {
    client: reqwest::Client,
}

impl EcotrackerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses an existing connection pool.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeviceClient for EcotrackerClient {
    async fn fetch(&self, address: &str, timeout: Duration) -> Result<DeviceReading> {
        let url = device_url(address);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(EcotrackerError::network(format!(
                "{url} answered with HTTP {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(&url, e))?;
        parse_reading(&body, Utc::now())
    }
}

/// The device serves its JSON document at the root path.
pub fn device_url(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        format!("{address}/")
    } else {
        format!("http://{address}/")
    }
}

fn request_error(url: &str, err: reqwest::Error) -> EcotrackerError {
    if err.is_timeout() {
        EcotrackerError::network(format!("request to {url} timed out"))
    } else {
        EcotrackerError::network(format!("request to {url} failed: {err}"))
    }
}

// Firmware revisions disagree on the counter names.
#[derive(Debug, Deserialize)]
struct EcotrackerPayload {
    power: f64,
    #[serde(rename = "energyCounterIn", alias = "energyIn", alias = "energy_in")]
    energy_counter_in: f64,
    #[serde(rename = "energyCounterOut", alias = "energyOut", alias = "energy_out")]
    energy_counter_out: f64,
}

pub(crate) fn parse_reading(body: &[u8], fetched_at: DateTime<Utc>) -> Result<DeviceReading> {
    let payload: EcotrackerPayload = serde_json::from_slice(body)
        .map_err(|e| EcotrackerError::format(format!("unexpected device payload: {e}")))?;
    Ok(DeviceReading {
        power_w: payload.power,
        energy_in_kwh: payload.energy_counter_in,
        energy_out_kwh: payload.energy_counter_out,
        fetched_at,
    })
}
