//! Configuration and provisioning
//!
//! One TOML file carries the server settings and the provisioning tables:
//! gateways, OTAA devices, ignored-address patterns and multicast groups.
//! Byte-valued fields (MACs, EUIs, keys) are hex strings and are decoded
//! when the rows are loaded into the store.

use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::lorawan::crypto::AesKey;
use crate::lorawan::region::{AdrConfig, Region, RxWinConfig};
use crate::lorawan::{DevAddr, Eui};
use crate::store::{
    AppBinding, Device, FcntCheck, Gateway, IgnoredLink, MulticastGroup, Store,
};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub udp: UdpConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    #[serde(default, rename = "gateway")]
    pub gateways: Vec<GatewayConfig>,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, rename = "ignore")]
    pub ignored: Vec<IgnoreConfig>,
    #[serde(default, rename = "multicast")]
    pub multicast: Vec<MulticastConfig>,
}

#[derive(Debug, Deserialize)]
pub struct UdpConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Worst-case server-side processing budget per uplink. The reply
    /// window choice (RX1 vs RX2) subtracts this from the RX1 deadline.
    #[serde(default = "default_preprocessing_delay")]
    pub preprocessing_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            preprocessing_delay_ms: default_preprocessing_delay(),
        }
    }
}

fn default_preprocessing_delay() -> u64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    /// 8-byte MAC, hex.
    pub mac: String,
    /// 3-byte NetID, hex.
    pub netid: String,
    pub desc: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    /// 8-byte DevEUI, hex.
    pub deveui: String,
    /// 16-byte AppKey, hex.
    pub appkey: String,
    /// 8-byte AppEUI, hex.
    pub appeui: Option<String>,
    #[serde(default = "default_true")]
    pub can_join: bool,
    pub region: Region,
    /// Application handler name; must exist in the registry.
    #[serde(default = "default_app")]
    pub app: String,
    pub appid: Option<String>,
    pub appargs: Option<String>,
    #[serde(default = "default_fcnt_check")]
    pub fcnt_check: FcntCheck,
    /// ADR parameters to command instead of the region defaults, e.g.
    /// `adr = { power = 1, datr = 5, chans = 7 }`.
    pub adr: Option<AdrConfig>,
    /// RX-window parameters applied at join instead of the region
    /// defaults, e.g. `rxwin = { rx1_dr_offset = 0, rx2_dr = 3, rx2_freq = 869.525 }`.
    pub rxwin: Option<RxWinConfig>,
}

fn default_true() -> bool {
    true
}

fn default_app() -> String {
    "logger".to_string()
}

fn default_fcnt_check() -> FcntCheck {
    FcntCheck::Strict16
}

#[derive(Debug, Deserialize)]
pub struct IgnoreConfig {
    /// 4-byte DevAddr, hex.
    pub devaddr: String,
    /// Optional 4-byte mask, hex; exact match when absent.
    pub mask: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MulticastConfig {
    pub devaddr: String,
    pub nwkskey: String,
    pub appskey: String,
    pub region: Region,
    #[serde(default)]
    pub fcntdown: u32,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Load the provisioning tables into the store. Malformed hex fields
    /// fail startup rather than silently dropping rows.
    pub fn provision(&self, store: &Store) -> anyhow::Result<()> {
        for gw in &self.gateways {
            store.put_gateway(Gateway {
                mac: parse_hex_array(&gw.mac)
                    .map_err(|e| anyhow::anyhow!("gateway mac {:?}: {}", gw.mac, e))?,
                netid: parse_hex_array(&gw.netid)
                    .map_err(|e| anyhow::anyhow!("gateway netid {:?}: {}", gw.netid, e))?,
                desc: gw.desc.clone(),
                gps: None,
                alt: None,
                last_rx: None,
            });
        }

        for dev in &self.devices {
            let deveui = Eui::from_str(&dev.deveui)
                .map_err(|e| anyhow::anyhow!("device deveui {:?}: {}", dev.deveui, e))?;
            let appkey: AesKey = parse_hex_array(&dev.appkey)
                .map_err(|e| anyhow::anyhow!("device {} appkey: {}", deveui, e))?;
            let appeui = match &dev.appeui {
                Some(raw) => Some(
                    Eui::from_str(raw)
                        .map_err(|e| anyhow::anyhow!("device {} appeui: {}", deveui, e))?,
                ),
                None => None,
            };
            store.put_device(Device {
                deveui,
                appeui,
                appkey,
                can_join: dev.can_join,
                region: dev.region,
                binding: AppBinding {
                    app: dev.app.clone(),
                    appid: dev.appid.clone(),
                    appargs: dev.appargs.clone(),
                },
                fcnt_check: dev.fcnt_check,
                adr_set: dev.adr,
                rxwin_set: dev.rxwin,
                last_join: None,
                devaddr: None,
            });
        }

        for ign in &self.ignored {
            let devaddr = DevAddr::from_str(&ign.devaddr)
                .map_err(|e| anyhow::anyhow!("ignore devaddr {:?}: {}", ign.devaddr, e))?;
            let mask = match &ign.mask {
                Some(raw) => Some(
                    u32::from_str_radix(raw, 16)
                        .map_err(|e| anyhow::anyhow!("ignore mask {:?}: {}", raw, e))?,
                ),
                None => None,
            };
            store.atomic(|t| t.ignored.push(IgnoredLink { devaddr, mask }));
        }

        for mc in &self.multicast {
            let devaddr = DevAddr::from_str(&mc.devaddr)
                .map_err(|e| anyhow::anyhow!("multicast devaddr {:?}: {}", mc.devaddr, e))?;
            let group = MulticastGroup {
                devaddr,
                nwkskey: parse_hex_array(&mc.nwkskey)
                    .map_err(|e| anyhow::anyhow!("multicast {} nwkskey: {}", devaddr, e))?,
                appskey: parse_hex_array(&mc.appskey)
                    .map_err(|e| anyhow::anyhow!("multicast {} appskey: {}", devaddr, e))?,
                fcntdown: mc.fcntdown,
                region: mc.region,
            };
            store.atomic(|t| t.multicast.insert(devaddr, group));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            udp: UdpConfig {
                bind: "0.0.0.0:1680".to_string(),
            },
            engine: EngineConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
            gateways: vec![],
            devices: vec![],
            ignored: vec![],
            multicast: vec![],
        }
    }
}

fn parse_hex_array<const N: usize>(raw: &str) -> anyhow::Result<[u8; N]> {
    let bytes = hex::decode(raw)?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected {} bytes, got {}", N, len))
}
