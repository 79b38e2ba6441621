use anyhow::{Context, Result};
use ble_mesh::messages::{GenericOnOffSet, GenericOnOffStatus};
use ble_mesh::{
    Address, ChannelBearer, KeyIndex, KeyStore, MessageKey, NetworkEngine, StaticNetwork,
    TransportConfig,
};
use std::sync::Arc;
use std::time::Duration;

const CONTROLLER: Address = Address::new(0x0001);
const LAMP: Address = Address::new(0x0010);

const NETWORK: &str = r#"{
    "local_node": "0001",
    "nodes": [
        {"name": "controller", "primary_address": "0001", "elements": [{"address": "0001"}]},
        {"name": "lamp", "primary_address": "0010", "elements": [
            {"address": "0010", "models": [
                {"model_id": 4096, "bound_application_keys": [0]}
            ]}
        ]}
    ]
}"#;

/// Two engines joined by an in-memory bearer: a controller switching a lamp on.
#[tokio::main]
async fn main() -> Result<()> {
    shared::logging::init_logging_pretty();

    let config = TransportConfig::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let net_key = KeyStore::generate_key();
    let app_key = KeyStore::generate_key();
    let lamp_device_key = KeyStore::generate_key();
    let keys = || -> Result<KeyStore> {
        let mut keys = KeyStore::new();
        keys.add_network_key(KeyIndex::new(0)?, net_key)?;
        keys.add_application_key(KeyIndex::new(0)?, KeyIndex::new(0)?, app_key)?;
        keys.add_device_key(LAMP, lamp_device_key)?;
        Ok(keys)
    };

    let controller_network = StaticNetwork::from_json(NETWORK)?;
    let mut lamp_network = controller_network.clone();
    lamp_network.local_node = LAMP;

    let (controller_bearer, lamp_bearer) = ChannelBearer::pair();
    let controller = NetworkEngine::builder(controller_bearer, Arc::new(controller_network))
        .config(config.clone())
        .keys(keys()?)
        .build()
        .await?;
    let lamp = Arc::new(
        NetworkEngine::builder(lamp_bearer, Arc::new(lamp_network))
            .config(config)
            .keys(keys()?)
            .build()
            .await?,
    );
    controller.start().await?;
    lamp.start().await?;
    tracing::info!(
        "Controller {} and lamp {} online",
        controller.local_address(),
        lamp.local_address()
    );

    // The lamp answers every Generic OnOff Set with its new state
    let responder = {
        let lamp = lamp.clone();
        let mut inbound = lamp.subscribe();
        tokio::spawn(async move {
            while let Ok(received) = inbound.recv().await {
                let (Some(set), MessageKey::Application(app_key)) =
                    (received.message.downcast_ref::<GenericOnOffSet>(), received.key)
                else {
                    continue;
                };
                tracing::info!("Lamp switched {}", if set.is_on { "on" } else { "off" });
                let status = GenericOnOffStatus::new(set.is_on);
                match lamp.send(status, Some(LAMP), received.source, None, app_key).await {
                    Ok(handle) => {
                        if let Err(e) = handle.outcome().await {
                            tracing::warn!("Status not delivered: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to send status: {}", e),
                }
            }
        })
    };

    let handle = controller
        .send_to_model(GenericOnOffSet::new(true, 1), Some(CONTROLLER), LAMP, 0x1000, None)
        .await?;
    let response = tokio::time::timeout(Duration::from_secs(10), handle.outcome())
        .await
        .context("lamp did not answer in time")??
        .context("acknowledged message completed without a response")?;

    if let Some(status) = response.message.downcast_ref::<GenericOnOffStatus>() {
        tracing::info!("Lamp {} reports on={}", response.source, status.is_on);
    }

    let stats = controller.stats();
    tracing::info!(
        pdus_sent = stats.pdus_sent,
        pdus_received = stats.pdus_received,
        responses_matched = stats.responses_matched,
        "Controller statistics"
    );

    controller.shutdown().await?;
    lamp.shutdown().await?;
    responder.abort();
    Ok(())
}
