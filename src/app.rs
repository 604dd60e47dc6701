//! Application dispatcher
//!
//! Decoded uplinks fan out to the application a device is bound to; the
//! application may answer with a downlink intent. Handlers are registered
//! by name and referenced from device provisioning.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::lorawan::DevAddr;
use crate::mac::{RxData, RxQ, TxData};
use crate::store::AppBinding;

/// Application verdict for one uplink.
#[derive(Debug, Clone)]
pub enum AppResult {
    /// Nothing to send (the engine may still emit an empty reply when the
    /// MAC layer requires one).
    Ok,
    /// Re-send the pending downlink for this device.
    Retransmit,
    /// Queue an application downlink.
    Send(TxData),
}

pub trait Application: Send + Sync {
    /// A device bound to this application completed a join.
    fn handle_join(&self, devaddr: DevAddr, binding: &AppBinding) -> anyhow::Result<()>;

    /// A device bound to this application sent an uplink.
    fn handle_rx(
        &self,
        devaddr: DevAddr,
        binding: &AppBinding,
        rx: &RxData,
        rxq: &RxQ,
    ) -> anyhow::Result<AppResult>;
}

/// Logs traffic, never replies. The default binding.
pub struct LoggerApp;

impl Application for LoggerApp {
    fn handle_join(&self, devaddr: DevAddr, binding: &AppBinding) -> anyhow::Result<()> {
        info!("join: DevAddr={} app={}", devaddr, binding.app);
        Ok(())
    }

    fn handle_rx(
        &self,
        devaddr: DevAddr,
        _binding: &AppBinding,
        rx: &RxData,
        rxq: &RxQ,
    ) -> anyhow::Result<AppResult> {
        info!(
            "rx: DevAddr={} FCnt={} FPort={} data={} rssi={} lost={}",
            devaddr,
            rx.fcnt,
            rx.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            hex::encode(&rx.data),
            rxq.rssi,
            rx.last_lost,
        );
        Ok(AppResult::Ok)
    }
}

/// Echoes the uplink payload back on the same port. Field-test helper.
pub struct EchoApp;

impl Application for EchoApp {
    fn handle_join(&self, devaddr: DevAddr, _binding: &AppBinding) -> anyhow::Result<()> {
        info!("echo join: DevAddr={}", devaddr);
        Ok(())
    }

    fn handle_rx(
        &self,
        _devaddr: DevAddr,
        _binding: &AppBinding,
        rx: &RxData,
        _rxq: &RxQ,
    ) -> anyhow::Result<AppResult> {
        if rx.data.is_empty() {
            return Ok(AppResult::Ok);
        }
        Ok(AppResult::Send(TxData {
            port: rx.port,
            data: rx.data.clone(),
            confirmed: false,
            pending: false,
        }))
    }
}

/// The built-in handler set.
pub fn default_registry() -> HashMap<String, Arc<dyn Application>> {
    let mut apps: HashMap<String, Arc<dyn Application>> = HashMap::new();
    apps.insert("logger".to_string(), Arc::new(LoggerApp));
    apps.insert("echo".to_string(), Arc::new(EchoApp));
    apps
}
