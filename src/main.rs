use anyhow::{bail, Context};
use ecotracker::config::{ConfigEntry, ConfigStore, JsonFileConfigStore, Settings};
use ecotracker::setup_flow::{
    ConfigFlow, FlowResult, OptionsInput, UserInput, ERROR_CANNOT_CONNECT,
};
use ecotracker::{DeviceClient, EcotrackerClient, Integration, LogSink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SETUP_RETRY_DELAY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Ecotracker bridge");
    let settings = Settings::from_env().context("Invalid ECOTRACKER_* environment")?;
    let store: Arc<dyn ConfigStore> = Arc::new(JsonFileConfigStore::new(&settings.config_path));
    let client: Arc<dyn DeviceClient> = Arc::new(EcotrackerClient::new());

    if let Some(address) = &settings.ip_address {
        if store.find_by_address(address)?.is_none() {
            add_device(&client, &store, address, settings.scan_interval).await?;
        }
    }

    let entries = store.entries()?;
    if entries.is_empty() {
        bail!(
            "No Ecotracker configured in {}; set ECOTRACKER_IP_ADDRESS to add one",
            settings.config_path.display()
        );
    }

    let sink = Arc::new(LogSink);
    let mut integrations = Vec::with_capacity(entries.len());
    for entry in &entries {
        let integration = match Integration::setup(entry, Arc::clone(&client), sink.clone()).await {
            Ok(integration) => integration,
            Err(err) => {
                warn!(entry_id = %entry.entry_id, error = %err, "Skipping invalid config entry");
                continue;
            }
        };
        if let Some(interval) = settings.scan_interval {
            if interval != integration.config().scan_interval {
                let result = integration
                    .options_flow(Arc::clone(&store))
                    .step_init(Some(OptionsInput {
                        scan_interval: interval.into(),
                    }))?;
                if let FlowResult::ShowForm { errors, .. } = result {
                    warn!(entry_id = %integration.entry_id(), ?errors, "Interval not applied");
                }
            }
        }
        integrations.push(integration);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    for integration in integrations {
        integration.unload();
    }
    Ok(())
}

/// Runs the config flow for `address`, retrying while the device is unreachable.
async fn add_device(
    client: &Arc<dyn DeviceClient>,
    store: &Arc<dyn ConfigStore>,
    address: &str,
    scan_interval: Option<u32>,
) -> anyhow::Result<ConfigEntry> {
    let mut flow = ConfigFlow::new(Arc::clone(client), Arc::clone(store));
    loop {
        let input = UserInput {
            ip_address: address.to_string(),
            scan_interval: scan_interval.map(i64::from),
        };
        match flow.step_user(Some(input)).await? {
            FlowResult::CreateEntry(entry) => return Ok(entry),
            FlowResult::ShowForm { errors, .. }
                if errors.values().any(|e| *e == ERROR_CANNOT_CONNECT) =>
            {
                warn!(address, "Ecotracker not reachable, retrying in {SETUP_RETRY_DELAY:?}");
                tokio::time::sleep(SETUP_RETRY_DELAY).await;
            }
            FlowResult::ShowForm { errors, .. } => bail!("Invalid Ecotracker setup: {errors:?}"),
            FlowResult::Abort { reason } => bail!("Ecotracker setup aborted: {reason}"),
        }
    }
}
