//! LoRaWAN 1.0.1 frame codec
//!
//! A PHY payload is `MHDR(1) | MACPayload | MIC(4)`. The MHDR's top three
//! bits select the message type; data frames carry an FHDR with DevAddr,
//! FCtrl, a 16-bit frame counter and up to 15 bytes of piggybacked MAC
//! commands (FOpts).
//!
//! All multi-byte identifiers (DevAddr, DevEUI, AppEUI) transit the wire in
//! little-endian byte order. The codec parses them into their logical form
//! (`u32`/`u64`) and re-reverses on serialize.

pub mod crypto;
pub mod region;

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 32-bit dynamic network address, assigned at join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevAddr(pub u32);

impl DevAddr {
    /// Parse from wire order (little-endian).
    pub fn from_wire(bytes: [u8; 4]) -> Self {
        DevAddr(u32::from_le_bytes(bytes))
    }

    /// Wire order (little-endian), also the reversed form used in the
    /// B0/Ai crypto blocks.
    pub fn to_wire(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// The NwkID: top 7 bits of the address.
    pub fn nwk_id(self) -> u8 {
        (self.0 >> 25) as u8
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(DevAddr)
    }
}

/// 64-bit extended unique identifier (DevEUI / AppEUI).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui(pub u64);

impl Eui {
    pub fn from_wire(bytes: [u8; 8]) -> Self {
        Eui(u64::from_le_bytes(bytes))
    }

    pub fn to_wire(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Eui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for Eui {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Eui)
    }
}

/// LoRaWAN MAC Header (MHDR) - Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    Rfu,
    Proprietary,
}

impl TryFrom<u8> for MType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match (value >> 5) & 0x07 {
            0b000 => Ok(MType::JoinRequest),
            0b001 => Ok(MType::JoinAccept),
            0b010 => Ok(MType::UnconfirmedDataUp),
            0b011 => Ok(MType::UnconfirmedDataDown),
            0b100 => Ok(MType::ConfirmedDataUp),
            0b101 => Ok(MType::ConfirmedDataDown),
            0b110 => Ok(MType::Rfu),
            0b111 => Ok(MType::Proprietary),
            _ => unreachable!(),
        }
    }
}

impl MType {
    /// The three MType bits.
    pub fn bits(self) -> u8 {
        match self {
            MType::JoinRequest => 0b000,
            MType::JoinAccept => 0b001,
            MType::UnconfirmedDataUp => 0b010,
            MType::UnconfirmedDataDown => 0b011,
            MType::ConfirmedDataUp => 0b100,
            MType::ConfirmedDataDown => 0b101,
            MType::Rfu => 0b110,
            MType::Proprietary => 0b111,
        }
    }

    /// MHDR byte: MType(3) | RFU(3) | Major(2), Major = 00 (LoRaWAN R1).
    pub fn mhdr(self) -> u8 {
        self.bits() << 5
    }

    pub fn is_uplink_data(self) -> bool {
        matches!(self, MType::UnconfirmedDataUp | MType::ConfirmedDataUp)
    }

    pub fn is_confirmed(self) -> bool {
        matches!(self, MType::ConfirmedDataUp | MType::ConfirmedDataDown)
    }

    /// Cipher/MIC direction byte: low bit of the MType value.
    /// 0 for data up, 1 for data down.
    pub fn dir(self) -> u8 {
        self.bits() & 1
    }
}

impl fmt::Display for MType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MType::JoinRequest => write!(f, "JoinRequest"),
            MType::JoinAccept => write!(f, "JoinAccept"),
            MType::UnconfirmedDataUp => write!(f, "UnconfirmedDataUp"),
            MType::UnconfirmedDataDown => write!(f, "UnconfirmedDataDown"),
            MType::ConfirmedDataUp => write!(f, "ConfirmedDataUp"),
            MType::ConfirmedDataDown => write!(f, "ConfirmedDataDown"),
            MType::Rfu => write!(f, "RFU"),
            MType::Proprietary => write!(f, "Proprietary"),
        }
    }
}

/// Frame Control byte (FCtrl)
///
/// MSB to LSB: ADR | ADRACKReq | ACK | FPending | FOptsLen(4).
/// On uplinks bit 4 is the Class-B flag; it is carried through unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    pub adr: bool,
    pub adr_ack_req: bool,
    pub ack: bool,
    pub fpending: bool,
}

impl FCtrl {
    /// Unpack a FCtrl byte into the flag set and the FOptsLen nibble.
    pub fn parse(byte: u8) -> (Self, u8) {
        (
            FCtrl {
                adr: (byte & 0x80) != 0,
                adr_ack_req: (byte & 0x40) != 0,
                ack: (byte & 0x20) != 0,
                fpending: (byte & 0x10) != 0,
            },
            byte & 0x0F,
        )
    }

    pub fn to_byte(self, fopts_len: u8) -> u8 {
        (self.adr as u8) << 7
            | (self.adr_ack_req as u8) << 6
            | (self.ack as u8) << 5
            | (self.fpending as u8) << 4
            | (fopts_len & 0x0F)
    }
}

/// Decoded join-request MACPayload plus MIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub app_eui: Eui,
    pub dev_eui: Eui,
    pub dev_nonce: u16,
    pub mic: [u8; 4],
}

impl JoinRequest {
    /// Serialize to a full PHY payload (MHDR through MIC).
    pub fn serialize(&self) -> Vec<u8> {
        let mut phy = Vec::with_capacity(23);
        phy.push(MType::JoinRequest.mhdr());
        phy.extend_from_slice(&self.app_eui.to_wire());
        phy.extend_from_slice(&self.dev_eui.to_wire());
        phy.extend_from_slice(&self.dev_nonce.to_le_bytes());
        phy.extend_from_slice(&self.mic);
        phy
    }
}

/// Decoded data frame (up or down).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    pub fcnt: u16,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
}

impl DataFrame {
    /// Serialize MHDR through the end of the MACPayload — the MIC input.
    pub fn serialize_msg(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(8 + self.fopts.len() + 1 + self.frm_payload.len());
        msg.push(self.mtype.mhdr());
        msg.extend_from_slice(&self.dev_addr.to_wire());
        msg.push(self.fctrl.to_byte(self.fopts.len() as u8));
        msg.extend_from_slice(&self.fcnt.to_le_bytes());
        msg.extend_from_slice(&self.fopts);
        if let Some(port) = self.fport {
            msg.push(port);
            msg.extend_from_slice(&self.frm_payload);
        }
        msg
    }

    /// Serialize to a full PHY payload (MHDR through MIC).
    pub fn serialize(&self) -> Vec<u8> {
        let mut phy = self.serialize_msg();
        phy.extend_from_slice(&self.mic);
        phy
    }
}

/// Parsed PHY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phy {
    JoinRequest(JoinRequest),
    /// Join-accept as received: everything after the MHDR is encrypted.
    JoinAccept { encrypted: Vec<u8> },
    Data(DataFrame),
    Proprietary { payload: Vec<u8> },
    /// RFU MType, kept undecoded.
    Rfu { payload: Vec<u8> },
}

impl fmt::Display for Phy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phy::Data(d) => write!(
                f,
                "{} DevAddr={} FCnt={} FPort={} Payload={} bytes ADR={}",
                d.mtype,
                d.dev_addr,
                d.fcnt,
                d.fport.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                d.frm_payload.len(),
                d.fctrl.adr,
            ),
            Phy::JoinRequest(j) => write!(
                f,
                "JoinRequest AppEUI={} DevEUI={} DevNonce={}",
                j.app_eui, j.dev_eui, j.dev_nonce
            ),
            Phy::JoinAccept { encrypted } => {
                write!(f, "JoinAccept (encrypted, {} bytes)", encrypted.len())
            }
            Phy::Proprietary { payload } => write!(f, "Proprietary ({} bytes)", payload.len()),
            Phy::Rfu { payload } => write!(f, "RFU ({} bytes)", payload.len()),
        }
    }
}

/// Decode a LoRaWAN PHY payload.
pub fn parse_phy(data: &[u8]) -> Result<Phy, Error> {
    if data.is_empty() {
        return Err(Error::BadFrame(data.to_vec()));
    }

    let mtype = MType::try_from(data[0])?;

    match mtype {
        MType::JoinRequest => parse_join_request(data),
        MType::JoinAccept => Ok(Phy::JoinAccept {
            encrypted: data[1..].to_vec(),
        }),
        MType::UnconfirmedDataUp
        | MType::UnconfirmedDataDown
        | MType::ConfirmedDataUp
        | MType::ConfirmedDataDown => parse_data_frame(mtype, data),
        MType::Proprietary => Ok(Phy::Proprietary {
            payload: data[1..].to_vec(),
        }),
        MType::Rfu => Ok(Phy::Rfu {
            payload: data[1..].to_vec(),
        }),
    }
}

fn parse_join_request(data: &[u8]) -> Result<Phy, Error> {
    // MHDR(1) + AppEUI(8) + DevEUI(8) + DevNonce(2) + MIC(4) = 23 bytes
    if data.len() != 23 {
        return Err(Error::BadFrame(data.to_vec()));
    }

    let mut app_eui = [0u8; 8];
    app_eui.copy_from_slice(&data[1..9]);
    let mut dev_eui = [0u8; 8];
    dev_eui.copy_from_slice(&data[9..17]);
    let app_eui = Eui::from_wire(app_eui);
    let dev_eui = Eui::from_wire(dev_eui);
    let dev_nonce = u16::from_le_bytes([data[17], data[18]]);
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&data[19..23]);

    Ok(Phy::JoinRequest(JoinRequest {
        app_eui,
        dev_eui,
        dev_nonce,
        mic,
    }))
}

fn parse_data_frame(mtype: MType, data: &[u8]) -> Result<Phy, Error> {
    // Minimum: MHDR(1) + DevAddr(4) + FCtrl(1) + FCnt(2) + MIC(4) = 12 bytes
    if data.len() < 12 {
        return Err(Error::BadFrame(data.to_vec()));
    }

    let dev_addr = DevAddr::from_wire([data[1], data[2], data[3], data[4]]);
    let (fctrl, fopts_len) = FCtrl::parse(data[5]);
    let fcnt = u16::from_le_bytes([data[6], data[7]]);

    let fopts_end = 8 + fopts_len as usize;
    let mic_start = data.len() - 4;
    if fopts_end > mic_start {
        return Err(Error::BadFrame(data.to_vec()));
    }
    let fopts = data[8..fopts_end].to_vec();

    // FPort + FRMPayload are absent when the body after FHDR is empty.
    let (fport, frm_payload) = if fopts_end < mic_start {
        (Some(data[fopts_end]), data[fopts_end + 1..mic_start].to_vec())
    } else {
        (None, vec![])
    };

    let mut mic = [0u8; 4];
    mic.copy_from_slice(&data[mic_start..]);

    Ok(Phy::Data(DataFrame {
        mtype,
        dev_addr,
        fctrl,
        fcnt,
        fopts,
        fport,
        frm_payload,
        mic,
    }))
}
