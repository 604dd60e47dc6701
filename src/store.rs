//! Session store
//!
//! All shared mutable state of the engine lives here: gateways, OTAA
//! device records, active links (sessions), pending downlinks, the RX/TX
//! frame logs, ignored-address patterns and multicast groups.
//!
//! Counter mutations (`fcntup` during classification, `fcntdown` during
//! emission) must run inside [`Store::atomic`], which serializes every
//! writer; per-DevAddr state transitions are thereby linearised. Status
//! and log writes go through the plain accessors (dirty writes are fine
//! there).

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lorawan::crypto::AesKey;
use crate::lorawan::region::{AdrConfig, Region, RxWinConfig};
use crate::lorawan::{DevAddr, Eui};
use crate::mac::RxQ;

/// 8-byte gateway MAC identifier (EUI-64).
pub type GatewayMac = [u8; 8];

/// A provisioned packet-forwarding gateway.
#[derive(Debug, Clone)]
pub struct Gateway {
    pub mac: GatewayMac,
    /// 24-bit network identifier; its low 7 bits seed assigned DevAddrs.
    pub netid: [u8; 3],
    pub desc: Option<String>,
    /// GPS position (latitude, longitude) from status reports.
    pub gps: Option<(f64, f64)>,
    pub alt: Option<i32>,
    pub last_rx: Option<DateTime<Utc>>,
}

/// Frame-counter validation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FcntCheck {
    /// 16-bit counters, no rollover: gap checked within the 16-bit space.
    #[serde(rename = "strict-16")]
    Strict16,
    /// 32-bit counters inferred from the 16 bits on the wire.
    #[serde(rename = "strict-32")]
    Strict32,
    /// Like strict-16, but a small received counter is taken as a device
    /// reset. Indistinguishable from a 16-bit rollover; choose per device.
    #[serde(rename = "reset-allowed")]
    ResetAllowed,
    /// No replay protection.
    #[serde(rename = "disabled")]
    Disabled,
}

/// Application binding of a device: which handler gets its traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppBinding {
    pub app: String,
    pub appid: Option<String>,
    pub appargs: Option<String>,
}

/// An OTAA device record.
#[derive(Debug, Clone)]
pub struct Device {
    pub deveui: Eui,
    pub appeui: Option<Eui>,
    pub appkey: AesKey,
    pub can_join: bool,
    pub region: Region,
    pub binding: AppBinding,
    pub fcnt_check: FcntCheck,
    pub adr_set: Option<AdrConfig>,
    pub rxwin_set: Option<RxWinConfig>,
    pub last_join: Option<DateTime<Utc>>,
    /// Current address; absent before the first join.
    pub devaddr: Option<DevAddr>,
}

/// Device status report (DevStatusAns): battery level and demodulation
/// margin as last reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevStat {
    pub battery: u8,
    pub margin: i8,
}

/// An active session, created by a join.
#[derive(Debug, Clone)]
pub struct Link {
    pub devaddr: DevAddr,
    pub deveui: Option<Eui>,
    pub region: Region,
    pub binding: AppBinding,
    pub nwkskey: AesKey,
    pub appskey: AesKey,
    pub fcntup: u32,
    pub fcntdown: u32,
    pub fcnt_check: FcntCheck,
    /// ADR bit last seen from the device.
    pub adr_flag_use: u8,
    /// ADR bit the network wants.
    pub adr_flag_set: Option<u8>,
    /// Parameters the device is believed to use.
    pub adr_use: Option<AdrConfig>,
    /// Parameters the network wants to command.
    pub adr_set: AdrConfig,
    pub rxwin_use: RxWinConfig,
    pub rxwin_set: RxWinConfig,
    pub last_mac: Option<GatewayMac>,
    pub last_rxq: Option<RxQ>,
    pub devstat: Option<DevStat>,
    /// fcntup at which the device status was last requested/refreshed.
    pub devstat_fcnt: u32,
    /// Recent (RSSI, SNR) samples for ADR decisions.
    pub last_qs: Vec<(f64, f64)>,
    pub last_rx: Option<DateTime<Utc>>,
    pub last_reset: Option<DateTime<Utc>>,
}

/// The most recently transmitted downlink for a DevAddr, kept so a
/// repeated uplink re-triggers the same PHY payload and a confirmed
/// downlink can be retried until acknowledged.
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub devaddr: DevAddr,
    pub phy: Vec<u8>,
    pub confirmed: bool,
}

/// One received application frame, appended to the RX log.
#[derive(Debug, Clone, Serialize)]
pub struct RxFrame {
    /// Monotonic frame id, assigned by the store.
    pub frid: u64,
    #[serde(with = "hex_mac")]
    pub mac: GatewayMac,
    pub rxq: RxQ,
    pub app: String,
    pub appid: Option<String>,
    pub appargs: Option<String>,
    #[serde(serialize_with = "ser_devaddr")]
    pub devaddr: DevAddr,
    pub fcnt: u32,
    pub port: Option<u8>,
    #[serde(serialize_with = "ser_hex")]
    pub data: Vec<u8>,
    pub datetime: DateTime<Utc>,
    pub devstat: Option<DevStat>,
}

/// One emitted downlink, appended to the TX log.
#[derive(Debug, Clone, Serialize)]
pub struct TxFrame {
    #[serde(serialize_with = "ser_devaddr")]
    pub devaddr: DevAddr,
    pub fcnt: u32,
    pub port: Option<u8>,
    #[serde(serialize_with = "ser_hex")]
    pub data: Vec<u8>,
    pub confirmed: bool,
    pub datetime: DateTime<Utc>,
}

/// DevAddr pattern: matching uplinks are dropped before MIC verification.
#[derive(Debug, Clone, Copy)]
pub struct IgnoredLink {
    pub devaddr: DevAddr,
    /// Exact match when absent, else `received & mask == devaddr`.
    pub mask: Option<u32>,
}

impl IgnoredLink {
    pub fn matches(&self, addr: DevAddr) -> bool {
        match self.mask {
            None => addr == self.devaddr,
            Some(mask) => addr.0 & mask == self.devaddr.0,
        }
    }
}

/// A multicast group: shares the downlink path with unicast links but
/// forbids confirmed frames and carries no FOpts.
#[derive(Debug, Clone)]
pub struct MulticastGroup {
    pub devaddr: DevAddr,
    pub nwkskey: AesKey,
    pub appskey: AesKey,
    pub fcntdown: u32,
    pub region: Region,
}

/// All tables, visible to `atomic` closures.
#[derive(Debug, Default)]
pub struct Tables {
    pub gateways: HashMap<GatewayMac, Gateway>,
    pub devices: HashMap<Eui, Device>,
    pub links: HashMap<DevAddr, Link>,
    pub pending: HashMap<DevAddr, PendingTx>,
    pub rxframes: BTreeMap<u64, RxFrame>,
    pub txframes: Vec<TxFrame>,
    pub ignored: Vec<IgnoredLink>,
    pub multicast: HashMap<DevAddr, MulticastGroup>,
    next_frid: u64,
}

impl Tables {
    /// Append an RX-log entry, assigning its frame id.
    pub fn push_rxframe(&mut self, mut frame: RxFrame) -> u64 {
        let frid = self.next_frid;
        self.next_frid += 1;
        frame.frid = frid;
        self.rxframes.insert(frid, frame);
        frid
    }

    pub fn purge_tx_frames(&mut self, devaddr: DevAddr) {
        self.txframes.retain(|f| f.devaddr != devaddr);
    }
}

/// The store: every table behind one lock, so `atomic` closures observe
/// and produce consistent snapshots.
#[derive(Debug, Default)]
pub struct Store {
    inner: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Run `f` under serializable isolation over all tables.
    pub fn atomic<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut tables = self.inner.lock().expect("store lock poisoned");
        f(&mut tables)
    }

    pub fn get_gateway(&self, mac: &GatewayMac) -> Option<Gateway> {
        self.atomic(|t| t.gateways.get(mac).cloned())
    }

    pub fn put_gateway(&self, gateway: Gateway) {
        self.atomic(|t| {
            t.gateways.insert(gateway.mac, gateway);
        });
    }

    pub fn get_device(&self, deveui: Eui) -> Option<Device> {
        self.atomic(|t| t.devices.get(&deveui).cloned())
    }

    pub fn put_device(&self, device: Device) {
        self.atomic(|t| {
            t.devices.insert(device.deveui, device);
        });
    }

    pub fn get_link(&self, devaddr: DevAddr) -> Option<Link> {
        self.atomic(|t| t.links.get(&devaddr).cloned())
    }

    pub fn put_link(&self, link: Link) {
        self.atomic(|t| {
            t.links.insert(link.devaddr, link);
        });
    }

    pub fn list_ignored(&self) -> Vec<IgnoredLink> {
        self.atomic(|t| t.ignored.clone())
    }

    pub fn get_pending(&self, devaddr: DevAddr) -> Option<PendingTx> {
        self.atomic(|t| t.pending.get(&devaddr).cloned())
    }

    pub fn put_pending(&self, pending: PendingTx) {
        self.atomic(|t| {
            t.pending.insert(pending.devaddr, pending);
        });
    }

    pub fn delete_pending(&self, devaddr: DevAddr) {
        self.atomic(|t| {
            t.pending.remove(&devaddr);
        });
    }

    pub fn purge_tx_frames(&self, devaddr: DevAddr) {
        self.atomic(|t| t.purge_tx_frames(devaddr));
    }

    pub fn put_rxframe(&self, frame: RxFrame) -> u64 {
        self.atomic(|t| t.push_rxframe(frame))
    }

    pub fn get_multicast(&self, devaddr: DevAddr) -> Option<MulticastGroup> {
        self.atomic(|t| t.multicast.get(&devaddr).cloned())
    }
}

mod hex_mac {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(mac: &[u8; 8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(mac))
    }
}

fn ser_devaddr<S: serde::Serializer>(
    addr: &crate::lorawan::DevAddr,
    ser: S,
) -> Result<S::Ok, S::Error> {
    ser.serialize_str(&addr.to_string())
}

fn ser_hex<S: serde::Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_str(&hex::encode(data))
}
