//! Semtech UDP packet-forwarder protocol (GWMP)
//!
//! Reference: https://github.com/Lora-net/packet_forwarder/blob/master/PROTOCOL.TXT
//!
//! Every datagram starts with a 4-byte header: version, a 2-byte
//! big-endian token, and the packet identifier. Gateway-originated
//! packets append the sender's 8-byte MAC and, for PUSH_DATA and TX_ACK,
//! a JSON object. Acknowledgements echo the token of the packet they
//! answer; PULL_RESP carries a fresh token.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::mac::{Stat, TxQ};
use crate::store::GatewayMac;

/// Protocol version spoken by this server.
pub const PROTOCOL_VERSION: u8 = 0x02;

// Packet identifier bytes.
const PUSH_DATA: u8 = 0x00;
const PUSH_ACK: u8 = 0x01;
const PULL_DATA: u8 = 0x02;
const PULL_RESP: u8 = 0x03;
const PULL_ACK: u8 = 0x04;
const TX_ACK: u8 = 0x05;

const HEADER_LEN: usize = 4;
const MAC_LEN: usize = 8;

/// A gateway-originated datagram.
#[derive(Debug)]
pub enum Upstream {
    /// Radio traffic (rxpk) and status reports (stat).
    PushData {
        token: u16,
        mac: GatewayMac,
        json: String,
    },
    /// Announces the return address for downlinks.
    PullData { token: u16, mac: GatewayMac },
    /// Outcome of an earlier PULL_RESP.
    TxAck {
        token: u16,
        mac: GatewayMac,
        json: Option<String>,
    },
}

/// Split a datagram into its gateway-originated parts.
///
/// All three upstream packet kinds share the same prefix, so the header
/// and MAC are peeled off once and only the body differs by identifier.
pub fn parse_upstream(datagram: &[u8]) -> anyhow::Result<Upstream> {
    if datagram.len() < HEADER_LEN + MAC_LEN {
        anyhow::bail!("datagram too short: {} bytes", datagram.len());
    }
    if datagram[0] != PROTOCOL_VERSION {
        anyhow::bail!("unsupported protocol version 0x{:02x}", datagram[0]);
    }

    let token = u16::from_be_bytes([datagram[1], datagram[2]]);
    let mut mac: GatewayMac = [0; MAC_LEN];
    mac.copy_from_slice(&datagram[HEADER_LEN..HEADER_LEN + MAC_LEN]);
    let body = &datagram[HEADER_LEN + MAC_LEN..];

    match datagram[3] {
        PUSH_DATA => Ok(Upstream::PushData {
            token,
            mac,
            json: utf8_body(body)?,
        }),
        PULL_DATA => Ok(Upstream::PullData { token, mac }),
        TX_ACK => Ok(Upstream::TxAck {
            token,
            mac,
            json: if body.is_empty() {
                None
            } else {
                Some(utf8_body(body)?)
            },
        }),
        other => anyhow::bail!("unexpected packet identifier 0x{:02x}", other),
    }
}

fn utf8_body(body: &[u8]) -> anyhow::Result<String> {
    Ok(std::str::from_utf8(body)
        .map_err(|e| anyhow::anyhow!("JSON body is not UTF-8: {}", e))?
        .to_string())
}

/// PUSH_ACK: the bare header, token echoed.
pub fn push_ack(token: u16) -> Vec<u8> {
    ack(token, PUSH_ACK)
}

/// PULL_ACK: the bare header, token echoed.
pub fn pull_ack(token: u16) -> Vec<u8> {
    ack(token, PULL_ACK)
}

fn ack(token: u16, ident: u8) -> Vec<u8> {
    let [hi, lo] = token.to_be_bytes();
    vec![PROTOCOL_VERSION, hi, lo, ident]
}

/// PULL_RESP: header plus a JSON-wrapped transmit order.
pub fn pull_resp(token: u16, txpk: &Txpk) -> anyhow::Result<Vec<u8>> {
    #[derive(Serialize)]
    struct Body<'a> {
        txpk: &'a Txpk,
    }

    let json = serde_json::to_vec(&Body { txpk })?;
    let mut datagram = BytesMut::with_capacity(HEADER_LEN + json.len());
    datagram.put_u8(PROTOCOL_VERSION);
    datagram.put_u16(token);
    datagram.put_u8(PULL_RESP);
    datagram.put_slice(&json);
    Ok(datagram.to_vec())
}

/// The JSON body of a PUSH_DATA.
#[derive(Debug, Deserialize)]
pub struct PushBody {
    pub rxpk: Option<Vec<Rxpk>>,
    pub stat: Option<Stat>,
}

/// One received radio packet, as reported by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rxpk {
    /// Concentrator timestamp in microseconds; downlink windows are
    /// scheduled relative to this.
    pub tmst: u32,
    /// UTC reception time, when the gateway has a clock source.
    pub time: Option<String>,
    /// Frequency in MHz.
    pub freq: f64,
    /// RF and IF chain the packet arrived on.
    pub chan: Option<u8>,
    pub rfch: Option<u8>,
    /// Modulation, "LORA" or "FSK".
    pub modu: Option<String>,
    /// Data-rate string, e.g. "SF7BW125".
    pub datr: String,
    /// Coding rate, e.g. "4/5".
    pub codr: Option<String>,
    /// RSSI in dBm.
    pub rssi: f64,
    /// Signal-to-noise ratio in dB.
    pub lsnr: Option<f64>,
    /// PHY payload size in bytes.
    pub size: u16,
    /// PHY payload, base64.
    pub data: String,
}

/// One transmit order for the gateway, placed inside a PULL_RESP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Txpk {
    /// Send immediately, ignoring `tmst`.
    pub imme: bool,
    /// Concentrator timestamp at which to transmit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tmst: Option<u32>,
    /// Frequency in MHz.
    pub freq: f64,
    /// RF chain.
    pub rfch: u8,
    /// TX power in dBm.
    pub powe: u8,
    /// Modulation, always "LORA" here.
    pub modu: String,
    /// Data-rate string.
    pub datr: String,
    /// Coding rate.
    pub codr: String,
    /// Invert IQ polarity (true for downlinks).
    pub ipol: bool,
    /// PHY payload size in bytes.
    pub size: u16,
    /// PHY payload, base64.
    pub data: String,
}

impl Txpk {
    /// Wrap a PHY payload and its radio instructions.
    pub fn from_phy(txq: &TxQ, phy: &[u8]) -> Self {
        use base64::Engine;
        Txpk {
            imme: txq.imme,
            tmst: txq.tmst,
            freq: txq.freq,
            rfch: txq.rfch,
            powe: txq.powe,
            modu: "LORA".to_string(),
            datr: txq.datr.clone(),
            codr: txq.codr.clone(),
            ipol: txq.ipol,
            size: phy.len() as u16,
            data: base64::engine::general_purpose::STANDARD.encode(phy),
        }
    }
}
