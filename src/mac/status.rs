//! Gateway status sink
//!
//! Each `stat` object in a PUSH_DATA refreshes the gateway row: last-seen
//! always, GPS position only when it is actually reported (some
//! concentrators emit zeros when they have no fix), altitude only when
//! additionally non-zero, description only when non-empty.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::mac::MacEngine;
use crate::store::GatewayMac;

/// Gateway status report (the `stat` JSON object of the packet-forwarder
/// protocol).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stat {
    /// UTC time of the report.
    pub time: Option<String>,
    /// Latitude in degrees.
    pub lati: Option<f64>,
    /// Longitude in degrees.
    pub long: Option<f64>,
    /// Altitude in meters.
    pub alti: Option<i32>,
    /// Radio packets received.
    pub rxnb: Option<u32>,
    /// Radio packets received with a valid CRC.
    pub rxok: Option<u32>,
    /// Radio packets forwarded.
    pub rxfw: Option<u32>,
    /// Upstream acknowledgement ratio in percent.
    pub ackr: Option<f64>,
    /// Downlink datagrams received.
    pub dwnb: Option<u32>,
    /// Packets emitted.
    pub txnb: Option<u32>,
    /// Free-form gateway description.
    pub desc: Option<String>,
}

pub(crate) fn update_gateway(
    engine: &MacEngine,
    gw_mac: GatewayMac,
    stat: Stat,
) -> Result<(), Error> {
    engine.store.atomic(|t| {
        let gateway = t.gateways.get_mut(&gw_mac).ok_or(Error::UnknownMac(gw_mac))?;

        gateway.last_rx = Some(Utc::now());

        if let (Some(lat), Some(lon)) = (stat.lati, stat.long) {
            if lat != 0.0 && lon != 0.0 {
                gateway.gps = Some((lat, lon));
                // Keep the position but drop the altitude when a receiver
                // reports lat/lon with a zero altitude.
                match stat.alti {
                    Some(alt) if alt != 0 => gateway.alt = Some(alt),
                    _ => {}
                }
            }
        }

        if let Some(desc) = &stat.desc {
            if !desc.is_empty() {
                gateway.desc = Some(desc.clone());
            }
        }

        debug!(
            "gateway {} status: rxok={:?} txnb={:?}",
            hex::encode(gw_mac),
            stat.rxok,
            stat.txnb
        );
        Ok(())
    })
}
