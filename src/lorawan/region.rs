//! Regional PHY parameters
//!
//! Pure functions of the region tag: data-rate string translation, receive
//! window placement and delays, ADR and RX-window defaults. Only the
//! parameters the MAC engine consults are modelled; duty-cycle and
//! dwell-time enforcement stay with the gateway.

use serde::{Deserialize, Serialize};

use crate::mac::{RxQ, TxQ};

/// Receive-window delay selector: data uplinks answer after RECEIVE_DELAY1,
/// join-requests after JOIN_ACCEPT_DELAY1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    Data,
    Join,
}

/// ADR parameter triple. `None` means "not yet known / not commanded".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AdrConfig {
    /// TX power index.
    pub power: Option<u8>,
    /// Data rate index.
    pub datr: Option<u8>,
    /// Channel mask.
    pub chans: Option<u64>,
}

/// RX-window parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RxWinConfig {
    pub rx1_dr_offset: u8,
    pub rx2_dr: u8,
    pub rx2_freq: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "EU868")]
    Eu868,
    #[serde(rename = "US915")]
    Us915,
}

impl Region {
    /// Parse a gateway data-rate string ("SF7BW125") into the region's
    /// uplink data-rate index.
    pub fn datar_to_dr(&self, datr: &str) -> Option<u8> {
        match self {
            Region::Eu868 => match datr {
                "SF12BW125" => Some(0),
                "SF11BW125" => Some(1),
                "SF10BW125" => Some(2),
                "SF9BW125" => Some(3),
                "SF8BW125" => Some(4),
                "SF7BW125" => Some(5),
                "SF7BW250" => Some(6),
                _ => None,
            },
            Region::Us915 => match datr {
                "SF10BW125" => Some(0),
                "SF9BW125" => Some(1),
                "SF8BW125" => Some(2),
                "SF7BW125" => Some(3),
                "SF8BW500" => Some(4),
                _ => None,
            },
        }
    }

    /// Data-rate index back to the gateway string form, downlink rates
    /// included.
    pub fn dr_to_datar(&self, dr: u8) -> &'static str {
        match self {
            Region::Eu868 => match dr {
                0 => "SF12BW125",
                1 => "SF11BW125",
                2 => "SF10BW125",
                3 => "SF9BW125",
                4 => "SF8BW125",
                5 => "SF7BW125",
                _ => "SF7BW250",
            },
            Region::Us915 => match dr {
                0 => "SF10BW125",
                1 => "SF9BW125",
                2 => "SF8BW125",
                3 => "SF7BW125",
                4 => "SF8BW500",
                8 => "SF12BW500",
                9 => "SF11BW500",
                10 => "SF10BW500",
                11 => "SF9BW500",
                12 => "SF8BW500",
                _ => "SF7BW500",
            },
        }
    }

    /// RECEIVE_DELAY1 / JOIN_ACCEPT_DELAY1 in milliseconds.
    pub fn rx1_delay(&self, kind: DelayKind) -> u64 {
        match kind {
            DelayKind::Data => 1_000,
            DelayKind::Join => 5_000,
        }
    }

    /// RECEIVE_DELAY2 / JOIN_ACCEPT_DELAY2: one second after RX1.
    pub fn rx2_delay(&self, kind: DelayKind) -> u64 {
        self.rx1_delay(kind) + 1_000
    }

    /// Default RX2 data-rate index.
    pub fn rx2_dr(&self) -> u8 {
        match self {
            Region::Eu868 => 0,
            Region::Us915 => 8,
        }
    }

    /// Default RX2 frequency in MHz.
    pub fn rx2_freq(&self) -> f64 {
        match self {
            Region::Eu868 => 869.525,
            Region::Us915 => 923.3,
        }
    }

    /// ADR defaults applied at join and after a counter reset.
    pub fn default_adr(&self) -> AdrConfig {
        AdrConfig {
            power: Some(match self {
                Region::Eu868 => 1,
                Region::Us915 => 5,
            }),
            datr: Some(0),
            chans: Some(match self {
                Region::Eu868 => 0x07,
                Region::Us915 => 0xFFFF_FFFF_FFFF_FFFF,
            }),
        }
    }

    /// RX-window defaults applied at join and after a counter reset.
    pub fn default_rxwin(&self) -> RxWinConfig {
        RxWinConfig {
            rx1_dr_offset: 0,
            rx2_dr: self.rx2_dr(),
            rx2_freq: self.rx2_freq(),
        }
    }

    /// Place a transmission in the RX1 window opened after `rxq`.
    pub fn rx1_window(&self, rxwin: &RxWinConfig, rxq: &RxQ, kind: DelayKind) -> TxQ {
        let (freq, datr) = match self {
            // EU868 RX1 mirrors the uplink channel and data rate
            Region::Eu868 => {
                let up_dr = self.datar_to_dr(&rxq.datr).unwrap_or(0);
                let dr = up_dr.saturating_sub(rxwin.rx1_dr_offset);
                (rxq.freq, self.dr_to_datar(dr).to_string())
            }
            // US915: downlink channel = uplink channel mod 8,
            // 923.3 + 0.6 * ch MHz, DR = min(upDR + 10 - offset, 13)
            Region::Us915 => {
                let up_chan = ((rxq.freq - 902.3) / 0.2).round() as i64;
                let dl_chan = up_chan.rem_euclid(8) as f64;
                let up_dr = self.datar_to_dr(&rxq.datr).unwrap_or(0);
                let dr = (up_dr + 10).saturating_sub(rxwin.rx1_dr_offset).min(13);
                (923.3 + 0.6 * dl_chan, self.dr_to_datar(dr).to_string())
            }
        };
        TxQ {
            imme: false,
            tmst: Some(rxq.tmst.wrapping_add((self.rx1_delay(kind) * 1_000) as u32)),
            freq,
            rfch: 0,
            powe: self.max_eirp(),
            datr,
            codr: rxq.codr.clone().unwrap_or_else(|| "4/5".to_string()),
            ipol: true,
        }
    }

    /// Place a transmission in the RX2 window opened after `rxq`.
    pub fn rx2_window(&self, rxwin: &RxWinConfig, rxq: &RxQ, kind: DelayKind) -> TxQ {
        TxQ {
            imme: false,
            tmst: Some(rxq.tmst.wrapping_add((self.rx2_delay(kind) * 1_000) as u32)),
            freq: rxwin.rx2_freq,
            rfch: 0,
            powe: self.max_eirp(),
            datr: self.dr_to_datar(rxwin.rx2_dr).to_string(),
            codr: rxq.codr.clone().unwrap_or_else(|| "4/5".to_string()),
            ipol: true,
        }
    }

    /// Radio parameters for multicast and server-initiated (Class C)
    /// downlinks: the RX2 parameter set, sent immediately unless the
    /// caller names a time.
    pub fn rf_group(&self, rxwin: &RxWinConfig, time: Option<u32>) -> TxQ {
        TxQ {
            imme: time.is_none(),
            tmst: time,
            freq: rxwin.rx2_freq,
            rfch: 0,
            powe: self.max_eirp(),
            datr: self.dr_to_datar(rxwin.rx2_dr).to_string(),
            codr: "4/5".to_string(),
            ipol: true,
        }
    }

    fn max_eirp(&self) -> u8 {
        match self {
            Region::Eu868 => 14,
            Region::Us915 => 20,
        }
    }
}
