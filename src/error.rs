use thiserror::Error;

use crate::lorawan::{DevAddr, Eui};
use crate::store::GatewayMac;

/// The primary error type for the MAC engine.
///
/// None of these are fatal: the gateway transport logs them and keeps
/// serving. Frames that must be dropped without diagnostics (ignored
/// DevAddr patterns, joins from non-joinable devices, MTypes outside the
/// processed set) never surface here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unknown gateway MAC {}", hex::encode(.0))]
    UnknownMac(GatewayMac),

    #[error("unknown DevEUI {0}")]
    UnknownDevEui(Eui),

    #[error("unknown DevAddr {0}")]
    UnknownDevAddr(DevAddr),

    #[error("bad MIC from {0}")]
    BadMic(String),

    #[error("unparseable frame: {}", hex::encode(.0))]
    BadFrame(Vec<u8>),

    #[error("FPort 0 frame with FOpts present")]
    DoubleFopts,

    #[error("frame counter gap too large for {devaddr}: received {fcnt}")]
    FcntGapTooLarge { devaddr: DevAddr, fcnt: u16 },

    #[error("operation not allowed")]
    NotAllowed,

    #[error("application error: {0}")]
    App(#[from] anyhow::Error),
}
