//! The Class-A MAC engine
//!
//! Converts PHY payloads received from a gateway into application events
//! and assembles downlink PHY payloads for the device's receive windows.
//! The engine is synchronous; the UDP transport is the async boundary.
//! Per-DevAddr state transitions are linearised by the store's atomic
//! sections, so any number of tasks may call into the engine in parallel.

mod downlink;
mod join;
mod status;
mod uplink;

pub use status::Stat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::app::Application;
use crate::error::Error;
use crate::lorawan::{parse_phy, DevAddr, Phy};
use crate::maccmd::MacCommandHandler;
use crate::store::{GatewayMac, Store};

/// Radio metadata for a received uplink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RxQ {
    /// Frequency in MHz.
    pub freq: f64,
    /// Data-rate string, e.g. "SF7BW125".
    pub datr: String,
    /// Coding rate, e.g. "4/5".
    pub codr: Option<String>,
    /// RSSI in dBm.
    pub rssi: f64,
    /// LoRa signal-to-noise ratio.
    pub lsnr: Option<f64>,
    /// Concentrator timestamp in microseconds.
    pub tmst: u32,
    /// Server-monotonic receive time in milliseconds.
    pub srvtmst: u64,
}

/// Radio instructions for a pending downlink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxQ {
    /// Send immediately, ignoring `tmst`.
    pub imme: bool,
    /// Concentrator timestamp at which to transmit.
    pub tmst: Option<u32>,
    pub freq: f64,
    pub rfch: u8,
    /// TX power in dBm.
    pub powe: u8,
    pub datr: String,
    pub codr: String,
    /// Downlinks invert the LoRa IQ polarity.
    pub ipol: bool,
}

/// Application payload for a downlink.
#[derive(Debug, Clone, Default)]
pub struct TxData {
    pub port: Option<u8>,
    pub data: Vec<u8>,
    pub confirmed: bool,
    /// Sets FPending: more data is queued for the device.
    pub pending: bool,
}

/// Decoded uplink handed to the application.
#[derive(Debug, Clone)]
pub struct RxData {
    pub fcnt: u32,
    pub port: Option<u8>,
    pub data: Vec<u8>,
    /// A confirmed downlink is outstanding and the device did not ACK it.
    pub last_lost: bool,
    /// The engine will transmit a reply even if the application has
    /// nothing to send.
    pub shall_reply: bool,
}

/// What the transport should do with the processed frame.
#[derive(Debug, Clone)]
pub enum Action {
    /// Transmit `phy` within the named window.
    Send { txq: TxQ, phy: Vec<u8> },
    /// Nothing to send.
    Nothing,
}

pub(crate) const MAX_FCNT_GAP: u16 = 16_384;
pub(crate) const MAX_LOST_AFTER_RESET: u16 = 10;

/// The MAC protocol engine.
pub struct MacEngine {
    pub(crate) store: Arc<Store>,
    pub(crate) apps: HashMap<String, Arc<dyn Application>>,
    pub(crate) maccmd: Arc<dyn MacCommandHandler>,
    pub(crate) preprocessing_delay_ms: u64,
    epoch: Instant,
}

impl MacEngine {
    pub fn new(
        store: Arc<Store>,
        apps: HashMap<String, Arc<dyn Application>>,
        maccmd: Arc<dyn MacCommandHandler>,
        preprocessing_delay_ms: u64,
    ) -> Self {
        MacEngine {
            store,
            apps,
            maccmd,
            preprocessing_delay_ms,
            epoch: Instant::now(),
        }
    }

    /// Monotonic milliseconds since engine start. The transport stamps
    /// `RxQ::srvtmst` from the same clock.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Process one PHY payload received by `gw_mac`.
    pub fn process_frame(&self, gw_mac: GatewayMac, rxq: RxQ, phy: &[u8]) -> Result<Action, Error> {
        let gateway = self
            .store
            .get_gateway(&gw_mac)
            .ok_or(Error::UnknownMac(gw_mac))?;

        match parse_phy(phy)? {
            Phy::JoinRequest(request) => join::handle_join(self, &gateway, &rxq, &request, phy),
            Phy::Data(frame) if frame.mtype.is_uplink_data() => {
                uplink::handle_uplink(self, &gateway, &rxq, frame, phy)
            }
            other => {
                // Downlink MTypes and proprietary frames arriving on the
                // uplink path are dropped without diagnostics.
                debug!("ignoring {} on uplink path", other);
                Ok(Action::Nothing)
            }
        }
    }

    /// Process a gateway status report.
    pub fn process_status(&self, gw_mac: GatewayMac, stat: Stat) -> Result<(), Error> {
        status::update_gateway(self, gw_mac, stat)
    }

    /// Server-initiated downlink (Class C style): transmit now or at the
    /// caller-specified concentrator time, on RX2 parameters.
    pub fn handle_downlink(
        &self,
        devaddr: DevAddr,
        time: Option<u32>,
        tx: TxData,
    ) -> Result<Action, Error> {
        downlink::handle_downlink(self, devaddr, time, tx)
    }

    /// Server-initiated multicast downlink.
    pub fn handle_multicast(
        &self,
        devaddr: DevAddr,
        time: Option<u32>,
        tx: TxData,
    ) -> Result<Action, Error> {
        downlink::handle_multicast(self, devaddr, time, tx)
    }

    pub(crate) fn app(&self, name: &str) -> Option<&Arc<dyn Application>> {
        self.apps.get(name)
    }
}
