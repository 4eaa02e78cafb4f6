//! Config flow (add a device) and options flow (change its interval).

use crate::config::{
    validate_interval, ConfigEntry, ConfigStore, PollingConfig, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SCAN_INTERVAL,
};
use crate::coordinator::Coordinator;
use crate::device_client::{DeviceClient, DeviceReading};
use crate::error::{EcotrackerError, Result};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const STEP_USER: &str = "user";
pub const STEP_INIT: &str = "init";

pub const ERROR_CANNOT_CONNECT: &str = "cannot_connect";
pub const ERROR_INVALID_INTERVAL: &str = "invalid_interval";
pub const ERROR_INVALID_ADDRESS: &str = "invalid_address";
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";

const FIELD_BASE: &str = "base";
const FIELD_IP_ADDRESS: &str = "ip_address";
const FIELD_SCAN_INTERVAL: &str = "scan_interval";

/// Values submitted on the `user` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserInput {
    pub ip_address: String,
    #[serde(default)]
    pub scan_interval: Option<i64>,
}

/// Values submitted on the options `init` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OptionsInput {
    pub scan_interval: i64,
}

/// Prefilled values for a form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormDefaults {
    pub ip_address: Option<String>,
    pub scan_interval: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    ShowForm {
        step_id: &'static str,
        defaults: FormDefaults,
        /// Field name (or `base`) to error key
        errors: BTreeMap<&'static str, &'static str>,
    },
    CreateEntry(ConfigEntry),
    Abort {
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFlowStep {
    UserInput,
    Validating,
    Created,
    Aborted,
}

/// Checks that the device answers with a complete reading.
pub async fn validate_connection(client: &dyn DeviceClient, address: &str) -> Result<DeviceReading> {
    client
        .fetch(address, DEFAULT_REQUEST_TIMEOUT)
        .await
        .map_err(|err| EcotrackerError::cannot_connect(err.to_string()))
}

pub struct ConfigFlow {
    client: Arc<dyn DeviceClient>,
    store: Arc<dyn ConfigStore>,
    step: ConfigFlowStep,
}

impl ConfigFlow {
    pub fn new(client: Arc<dyn DeviceClient>, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            client,
            store,
            step: ConfigFlowStep::UserInput,
        }
    }

    pub fn step(&self) -> ConfigFlowStep {
        self.step
    }

    /// Shows the form when called without input, otherwise validates and creates the entry.
    pub async fn step_user(&mut self, input: Option<UserInput>) -> Result<FlowResult> {
        let Some(input) = input else {
            return Ok(user_form(None, DEFAULT_SCAN_INTERVAL.into(), BTreeMap::new()));
        };

        let requested_interval = input
            .scan_interval
            .unwrap_or_else(|| DEFAULT_SCAN_INTERVAL.into());
        let address = input.ip_address.trim().to_string();

        let mut errors = BTreeMap::new();
        let interval = match validate_interval(requested_interval) {
            Ok(interval) => Some(interval),
            Err(_) => {
                errors.insert(FIELD_SCAN_INTERVAL, ERROR_INVALID_INTERVAL);
                None
            }
        };
        if address.is_empty() {
            errors.insert(FIELD_IP_ADDRESS, ERROR_INVALID_ADDRESS);
        }
        let (Some(interval), true) = (interval, errors.is_empty()) else {
            return Ok(user_form(Some(address), requested_interval, errors));
        };

        let config = PollingConfig::new(address, interval)?;
        // Distinct addresses may still collide on the derived entry id.
        let entry_id = ConfigEntry::new(config.clone()).entry_id;
        if self.store.find_by_address(&config.address)?.is_some()
            || self.store.find_by_entry_id(&entry_id)?.is_some()
        {
            warn!(address = %config.address, %entry_id, "Ecotracker already configured");
            self.step = ConfigFlowStep::Aborted;
            return Ok(FlowResult::Abort {
                reason: ABORT_ALREADY_CONFIGURED,
            });
        }

        self.step = ConfigFlowStep::Validating;
        if let Err(err) = validate_connection(self.client.as_ref(), &config.address).await {
            warn!(address = %config.address, error = %err, "Ecotracker setup failed");
            self.step = ConfigFlowStep::UserInput;
            errors.insert(FIELD_BASE, ERROR_CANNOT_CONNECT);
            return Ok(user_form(
                Some(config.address),
                config.scan_interval.into(),
                errors,
            ));
        }

        let entry = ConfigEntry::new(config);
        self.store.save(&entry)?;
        self.step = ConfigFlowStep::Created;
        info!(entry_id = %entry.entry_id, title = %entry.title, "Created config entry");
        Ok(FlowResult::CreateEntry(entry))
    }
}

fn user_form(
    ip_address: Option<String>,
    scan_interval: i64,
    errors: BTreeMap<&'static str, &'static str>,
) -> FlowResult {
    FlowResult::ShowForm {
        step_id: STEP_USER,
        defaults: FormDefaults {
            ip_address,
            scan_interval,
        },
        errors,
    }
}

/// Edits the interval of an existing entry and pushes it to the running coordinator.
pub struct OptionsFlow {
    entry: ConfigEntry,
    store: Arc<dyn ConfigStore>,
    coordinator: Option<Arc<Coordinator>>,
}

impl OptionsFlow {
    pub fn new(entry: ConfigEntry, store: Arc<dyn ConfigStore>) -> Self {
        Self {
            entry,
            store,
            coordinator: None,
        }
    }

    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn step_init(&mut self, input: Option<OptionsInput>) -> Result<FlowResult> {
        let current = i64::from(self.entry.data.scan_interval);
        let Some(input) = input else {
            return Ok(options_form(current, BTreeMap::new()));
        };

        let Ok(interval) = validate_interval(input.scan_interval) else {
            let errors = BTreeMap::from([(FIELD_SCAN_INTERVAL, ERROR_INVALID_INTERVAL)]);
            return Ok(options_form(input.scan_interval, errors));
        };

        self.entry.data.scan_interval = interval;
        self.store.save(&self.entry)?;
        if let Some(coordinator) = &self.coordinator {
            coordinator.update_interval(interval)?;
        }
        info!(entry_id = %self.entry.entry_id, interval, "Updated config entry options");
        Ok(FlowResult::CreateEntry(self.entry.clone()))
    }
}

fn options_form(scan_interval: i64, errors: BTreeMap<&'static str, &'static str>) -> FlowResult {
    FlowResult::ShowForm {
        step_id: STEP_INIT,
        defaults: FormDefaults {
            ip_address: None,
            scan_interval,
        },
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;
    use crate::test_support::{reading, ScriptedClient};

    fn user_input(address: &str, interval: Option<i64>) -> Option<UserInput> {
        Some(UserInput {
            ip_address: address.to_string(),
            scan_interval: interval,
        })
    }

    fn form_errors(result: &FlowResult) -> BTreeMap<&'static str, &'static str> {
        match result {
            FlowResult::ShowForm { errors, .. } => errors.clone(),
            other => panic!("Expected a form, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initial_form_has_defaults() {
        let store = Arc::new(MemoryConfigStore::new());
        let mut flow = ConfigFlow::new(ScriptedClient::immediate(vec![]), store);

        let result = flow.step_user(None).await.unwrap();
        assert_eq!(
            result,
            FlowResult::ShowForm {
                step_id: STEP_USER,
                defaults: FormDefaults {
                    ip_address: None,
                    scan_interval: 5,
                },
                errors: BTreeMap::new(),
            }
        );
        assert_eq!(flow.step(), ConfigFlowStep::UserInput);
    }

    #[tokio::test]
    async fn test_successful_setup_persists_entry() {
        let client = ScriptedClient::immediate(vec![Ok(reading(100.0, 5.0, 1.0))]);
        let store = Arc::new(MemoryConfigStore::new());
        let mut flow = ConfigFlow::new(client.clone(), store.clone());

        let result = flow
            .step_user(user_input(" 192.168.1.40 ", Some(10)))
            .await
            .unwrap();

        let FlowResult::CreateEntry(entry) = result else {
            panic!("Expected entry creation");
        };
        assert_eq!(entry.title, "Ecotracker (192.168.1.40)");
        assert_eq!(entry.data, PollingConfig::new("192.168.1.40", 10).unwrap());
        assert_eq!(flow.step(), ConfigFlowStep::Created);
        assert_eq!(client.addresses(), vec!["192.168.1.40"]);
        assert_eq!(store.find_by_address("192.168.1.40").unwrap(), Some(entry));
    }

    #[tokio::test]
    async fn test_interval_defaults_to_five() {
        let client = ScriptedClient::immediate(vec![Ok(reading(1.0, 1.0, 1.0))]);
        let mut flow = ConfigFlow::new(client, Arc::new(MemoryConfigStore::new()));

        let result = flow.step_user(user_input("10.0.0.7", None)).await.unwrap();
        let FlowResult::CreateEntry(entry) = result else {
            panic!("Expected entry creation");
        };
        assert_eq!(entry.data.scan_interval, DEFAULT_SCAN_INTERVAL);
    }

    #[tokio::test]
    async fn test_unreachable_device_allows_retry() {
        let client = ScriptedClient::immediate(vec![
            Err(EcotrackerError::network("connection refused")),
            Err(EcotrackerError::format("missing field `energyCounterOut`")),
            Ok(reading(100.0, 5.0, 1.0)),
        ]);
        let store = Arc::new(MemoryConfigStore::new());
        let mut flow = ConfigFlow::new(client.clone(), store.clone());

        for _ in 0..2 {
            let result = flow.step_user(user_input("10.0.0.8", Some(5))).await.unwrap();
            assert_eq!(
                form_errors(&result),
                BTreeMap::from([("base", ERROR_CANNOT_CONNECT)])
            );
            assert_eq!(flow.step(), ConfigFlowStep::UserInput);
        }
        assert!(store.entries().unwrap().is_empty());

        let result = flow.step_user(user_input("10.0.0.8", Some(5))).await.unwrap();
        assert!(matches!(result, FlowResult::CreateEntry(_)));
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn test_out_of_range_interval_is_rejected_before_connecting() {
        let client = ScriptedClient::immediate(vec![]);
        let mut flow = ConfigFlow::new(client.clone(), Arc::new(MemoryConfigStore::new()));

        for interval in [0, -1, 3601] {
            let result = flow
                .step_user(user_input("10.0.0.9", Some(interval)))
                .await
                .unwrap();
            assert_eq!(
                form_errors(&result),
                BTreeMap::from([("scan_interval", ERROR_INVALID_INTERVAL)])
            );
        }
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_address_is_rejected() {
        let client = ScriptedClient::immediate(vec![]);
        let mut flow = ConfigFlow::new(client.clone(), Arc::new(MemoryConfigStore::new()));

        let result = flow.step_user(user_input("  ", Some(5))).await.unwrap();
        assert_eq!(
            form_errors(&result),
            BTreeMap::from([("ip_address", ERROR_INVALID_ADDRESS)])
        );
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_address_aborts() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .save(&ConfigEntry::new(PollingConfig::new("10.0.0.10", 5).unwrap()))
            .unwrap();
        let client = ScriptedClient::immediate(vec![]);
        let mut flow = ConfigFlow::new(client.clone(), store);

        let result = flow.step_user(user_input("10.0.0.10", Some(5))).await.unwrap();
        assert_eq!(
            result,
            FlowResult::Abort {
                reason: ABORT_ALREADY_CONFIGURED
            }
        );
        assert_eq!(flow.step(), ConfigFlowStep::Aborted);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_colliding_entry_id_aborts() {
        let store = Arc::new(MemoryConfigStore::new());
        store
            .save(&ConfigEntry::new(PollingConfig::new("meter-1.lan", 5).unwrap()))
            .unwrap();
        let client = ScriptedClient::immediate(vec![Ok(reading(1.0, 1.0, 1.0))]);
        let mut flow = ConfigFlow::new(client.clone(), store.clone());

        // Same host in another case, then a different host with the same id
        for address in ["Meter-1.LAN", "meter.1-lan"] {
            let result = flow.step_user(user_input(address, Some(5))).await.unwrap();
            assert_eq!(
                result,
                FlowResult::Abort {
                    reason: ABORT_ALREADY_CONFIGURED
                }
            );
        }
        assert_eq!(client.calls(), 0);
        assert_eq!(store.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_options_form_shows_current_interval() {
        let entry = ConfigEntry::new(PollingConfig::new("10.0.0.11", 30).unwrap());
        let mut flow = OptionsFlow::new(entry, Arc::new(MemoryConfigStore::new()));

        let result = flow.step_init(None).unwrap();
        let FlowResult::ShowForm {
            step_id, defaults, ..
        } = result
        else {
            panic!("Expected a form");
        };
        assert_eq!(step_id, STEP_INIT);
        assert_eq!(defaults.scan_interval, 30);
    }

    #[test]
    fn test_options_reject_invalid_interval() {
        let store = Arc::new(MemoryConfigStore::new());
        let entry = ConfigEntry::new(PollingConfig::new("10.0.0.12", 30).unwrap());
        store.save(&entry).unwrap();
        let mut flow = OptionsFlow::new(entry, store.clone());

        let result = flow.step_init(Some(OptionsInput { scan_interval: 0 })).unwrap();
        assert_eq!(
            form_errors(&result),
            BTreeMap::from([("scan_interval", ERROR_INVALID_INTERVAL)])
        );
        let stored = store.find_by_address("10.0.0.12").unwrap().unwrap();
        assert_eq!(stored.data.scan_interval, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_options_update_store_and_running_coordinator() {
        let store = Arc::new(MemoryConfigStore::new());
        let entry = ConfigEntry::new(PollingConfig::new("10.0.0.13", 5).unwrap());
        store.save(&entry).unwrap();

        let client = ScriptedClient::immediate(vec![Ok(reading(100.0, 5.0, 1.0))]);
        let coordinator = Coordinator::new(entry.data.clone(), client).unwrap();
        coordinator.start().await;

        let mut flow = OptionsFlow::new(entry, store.clone()).with_coordinator(coordinator.clone());
        let result = flow
            .step_init(Some(OptionsInput { scan_interval: 60 }))
            .unwrap();

        let FlowResult::CreateEntry(updated) = result else {
            panic!("Expected updated entry");
        };
        assert_eq!(updated.data.scan_interval, 60);
        assert_eq!(
            store.find_by_address("10.0.0.13").unwrap().unwrap().data.scan_interval,
            60
        );
        assert_eq!(coordinator.config().scan_interval, 60);
        // The cached reading survives the interval change
        assert_eq!(coordinator.current_reading().map(|r| r.power_w), Some(100.0));
        coordinator.stop();
    }
}
