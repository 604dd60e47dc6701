//! MAC-command handling
//!
//! Uplink FOpts (or an FPort-0 FRMPayload) carry MAC commands; answers and
//! network-initiated requests ride back in downlink FOpts. The engine
//! treats the handler as a collaborator behind a trait so deployments can
//! swap in a full ADR controller.

use tracing::debug;

use crate::mac::RxQ;
use crate::store::{DevStat, Link, RxFrame};

/// FOpts field limit per the frame format.
pub const MAX_FOPTS_LEN: usize = 15;

/// Request a fresh DevStatusAns once the counter has advanced this far
/// past the last answer.
const DEVSTAT_REFRESH_FCNT: u32 = 100;

/// Quality-sample window size kept on the link.
const MAX_QS_SAMPLES: usize = 20;

// Command identifiers (LoRaWAN 1.0.1 §5)
const CID_LINK_CHECK: u8 = 0x02;
const CID_LINK_ADR: u8 = 0x03;
const CID_DUTY_CYCLE: u8 = 0x04;
const CID_RX_PARAM_SETUP: u8 = 0x05;
const CID_DEV_STATUS: u8 = 0x06;
const CID_NEW_CHANNEL: u8 = 0x07;
const CID_RX_TIMING_SETUP: u8 = 0x08;

pub trait MacCommandHandler: Send + Sync {
    /// Consume uplink MAC commands. May update the link (quality window,
    /// device status) and annotate the RX-log entry; returns the FOpts
    /// bytes to piggyback on the next downlink.
    fn handle(&self, rxq: &RxQ, link: &mut Link, fopts_in: &[u8], rxframe: &mut RxFrame)
        -> Vec<u8>;

    /// Network-initiated requests for a downlink being built outside the
    /// uplink path.
    fn build_fopts(&self, link: &Link) -> Vec<u8>;
}

/// Answers LinkCheckReq, tracks device status, keeps the link quality
/// window. Unknown commands are logged and skipped.
pub struct DefaultMacHandler;

impl MacCommandHandler for DefaultMacHandler {
    fn handle(
        &self,
        rxq: &RxQ,
        link: &mut Link,
        fopts_in: &[u8],
        rxframe: &mut RxFrame,
    ) -> Vec<u8> {
        // Every uplink contributes a quality sample.
        link.last_qs.push((rxq.rssi, rxq.lsnr.unwrap_or(0.0)));
        if link.last_qs.len() > MAX_QS_SAMPLES {
            let excess = link.last_qs.len() - MAX_QS_SAMPLES;
            link.last_qs.drain(..excess);
        }

        let mut out = Vec::new();
        let mut cmds = fopts_in.iter().copied();
        while let Some(cid) = cmds.next() {
            match cid {
                CID_LINK_CHECK => {
                    // LinkCheckAns: margin above the demodulation floor,
                    // single receiving gateway.
                    let margin = (rxq.lsnr.unwrap_or(0.0) + 20.0).clamp(0.0, 254.0) as u8;
                    out.extend_from_slice(&[CID_LINK_CHECK, margin, 1]);
                }
                CID_DEV_STATUS => {
                    // DevStatusAns(battery, margin)
                    let battery = cmds.next();
                    let margin = cmds.next();
                    if let (Some(battery), Some(margin)) = (battery, margin) {
                        let stat = DevStat {
                            battery,
                            margin: (margin & 0x3F) as i8 - if margin & 0x20 != 0 { 64 } else { 0 },
                        };
                        link.devstat = Some(stat);
                        link.devstat_fcnt = link.fcntup;
                        rxframe.devstat = Some(stat);
                    }
                }
                // Answers to network requests we do not originate yet:
                // consume their payloads so parsing stays aligned.
                CID_LINK_ADR | CID_RX_PARAM_SETUP | CID_NEW_CHANNEL => {
                    cmds.next();
                }
                CID_DUTY_CYCLE | CID_RX_TIMING_SETUP => {}
                unknown => {
                    // Unknown CID: length is unknowable, stop here.
                    debug!("unknown MAC command 0x{:02x}, dropping rest", unknown);
                    break;
                }
            }
        }

        out.extend_from_slice(&self.build_fopts(link));
        out.truncate(MAX_FOPTS_LEN);
        out
    }

    fn build_fopts(&self, link: &Link) -> Vec<u8> {
        // DevStatusReq once the counter has moved far enough past the
        // last answer. ADR transitions zero devstat_fcnt, which re-arms
        // the request early.
        if link.fcntup.wrapping_sub(link.devstat_fcnt) >= DEVSTAT_REFRESH_FCNT {
            vec![CID_DEV_STATUS]
        } else {
            vec![]
        }
    }
}
