//! Uplink pipeline
//!
//! Ignore filter → session lookup → frame-counter classification → MIC
//! verification → payload decryption → dispatch. Classification, MIC
//! check and the counter update run in one atomic section so concurrent
//! uplinks for the same DevAddr linearise.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::app::AppResult;
use crate::error::Error;
use crate::lorawan::crypto::{data_mic, payload_cipher, reverse, Direction};
use crate::lorawan::region::DelayKind;
use crate::lorawan::{DataFrame, MType};
use crate::mac::{downlink, Action, MacEngine, RxData, RxQ, TxData, TxQ};
use crate::mac::{MAX_FCNT_GAP, MAX_LOST_AFTER_RESET};
use crate::store::{FcntCheck, Gateway, Link, RxFrame};

/// How an in-window frame counter relates to the session counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FcntClass {
    New,
    Retransmit,
    Reset,
}

pub(crate) fn handle_uplink(
    engine: &MacEngine,
    gateway: &Gateway,
    rxq: &RxQ,
    frame: DataFrame,
    phy: &[u8],
) -> Result<Action, Error> {
    let devaddr = frame.dev_addr;

    // Step 1: ignore filter, before any crypto.
    if engine
        .store
        .list_ignored()
        .iter()
        .any(|pattern| pattern.matches(devaddr))
    {
        debug!("ignoring uplink from {}", devaddr);
        return Ok(Action::Nothing);
    }

    let msg = &phy[..phy.len() - 4];

    // Steps 2-4: lookup, classification, MIC verify and counter commit in
    // one transaction.
    let (class, mut link) = engine.store.atomic(|t| {
        let link = t
            .links
            .get_mut(&devaddr)
            .ok_or(Error::UnknownDevAddr(devaddr))?;

        let (class, fcnt_new) = classify_fcnt(link.fcnt_check, link.fcntup, frame.fcnt)
            .ok_or(Error::FcntGapTooLarge {
                devaddr,
                fcnt: frame.fcnt,
            })?;

        let expected = data_mic(&link.nwkskey, Direction::Up, devaddr, fcnt_new, msg);
        if expected != frame.mic {
            return Err(Error::BadMic(devaddr.to_string()));
        }

        match class {
            FcntClass::New => link.fcntup = fcnt_new,
            FcntClass::Retransmit => {}
            FcntClass::Reset => {
                link.fcntup = fcnt_new;
                link.adr_use = None;
                link.adr_flag_use = 0;
                link.rxwin_use = link.region.default_rxwin();
                link.last_reset = Some(Utc::now());
            }
        }
        Ok((class, link.clone()))
    })?;

    // Step 5: payload decryption. FPort 0 carries MAC commands under the
    // NwkSKey and excludes FOpts in the FHDR.
    let fcnt32 = link.fcntup;
    let (fopts_in, app_data) = match frame.fport {
        Some(0) => {
            if !frame.fopts.is_empty() {
                return Err(Error::DoubleFopts);
            }
            let plain = payload_cipher(
                &link.nwkskey,
                Direction::Up,
                devaddr,
                fcnt32,
                &frame.frm_payload,
            );
            (reverse(&plain), vec![])
        }
        Some(_) => {
            let plain = payload_cipher(
                &link.appskey,
                Direction::Up,
                devaddr,
                fcnt32,
                &frame.frm_payload,
            );
            (frame.fopts.clone(), plain)
        }
        None => (frame.fopts.clone(), vec![]),
    };

    let mut rxframe = RxFrame {
        frid: 0,
        mac: gateway.mac,
        rxq: rxq.clone(),
        app: link.binding.app.clone(),
        appid: link.binding.appid.clone(),
        appargs: link.binding.appargs.clone(),
        devaddr,
        fcnt: fcnt32,
        port: frame.fport,
        data: app_data.clone(),
        datetime: Utc::now(),
        devstat: link.devstat,
    };

    // Step 6: dispatch by classification.
    match class {
        FcntClass::Retransmit => {
            debug!("retransmitted uplink from {} FCnt={}", devaddr, frame.fcnt);
            engine.store.put_rxframe(rxframe);
            match engine.store.get_pending(devaddr) {
                Some(pending) => {
                    let txq = link.region.rx1_window(&link.rxwin_use, rxq, DelayKind::Data);
                    Ok(Action::Send {
                        txq,
                        phy: pending.phy,
                    })
                }
                None => Ok(Action::Nothing),
            }
        }
        FcntClass::Reset => {
            info!("frame counter reset for {}", devaddr);
            engine.store.delete_pending(devaddr);
            engine.store.purge_tx_frames(devaddr);
            process_new(engine, rxq, &frame, &mut link, fopts_in, &mut rxframe)
        }
        FcntClass::New => process_new(engine, rxq, &frame, &mut link, fopts_in, &mut rxframe),
    }
}

/// Steps 7.1-7.6: ADR tracking, MAC commands, persistence, reply decision.
fn process_new(
    engine: &MacEngine,
    rxq: &RxQ,
    frame: &DataFrame,
    link: &mut Link,
    fopts_in: Vec<u8>,
    rxframe: &mut RxFrame,
) -> Result<Action, Error> {
    let devaddr = link.devaddr;

    track_adr(link, frame, rxq);

    let fopts_out = engine.maccmd.handle(rxq, link, &fopts_in, rxframe);

    link.last_rx = Some(Utc::now());
    link.last_mac = Some(rxframe.mac);
    link.last_rxq = Some(rxq.clone());
    engine.store.put_link(link.clone());
    engine.store.put_rxframe(rxframe.clone());

    // A pending confirmed downlink the device did not ACK is lost; keep
    // its PHY around for an application-ordered retransmit.
    let pending = engine.store.get_pending(devaddr);
    let last_lost = pending
        .as_ref()
        .map(|p| p.confirmed && !frame.fctrl.ack)
        .unwrap_or(false);

    let shall_reply = frame.mtype == MType::ConfirmedDataUp
        || frame.fctrl.adr_ack_req
        || !fopts_out.is_empty();

    let rx = RxData {
        fcnt: link.fcntup,
        port: frame.fport,
        data: rxframe.data.clone(),
        last_lost,
        shall_reply,
    };

    let app = engine
        .app(&link.binding.app)
        .ok_or_else(|| Error::App(anyhow::anyhow!("no such application {}", link.binding.app)))?;

    let ack = frame.mtype == MType::ConfirmedDataUp;
    match app.handle_rx(devaddr, &link.binding, &rx, rxq)? {
        AppResult::Retransmit => match pending {
            Some(p) => Ok(Action::Send {
                txq: choose_tx(engine, link, rxq),
                phy: p.phy,
            }),
            None => {
                warn!("application asked to retransmit but {} has no pending frame", devaddr);
                Ok(Action::Nothing)
            }
        },
        AppResult::Send(tx) => {
            let phy = downlink::encode_unicast(engine, devaddr, ack, fopts_out, &tx)?;
            Ok(Action::Send {
                txq: choose_tx(engine, link, rxq),
                phy,
            })
        }
        AppResult::Ok if shall_reply => {
            let tx = TxData::default();
            let phy = downlink::encode_unicast(engine, devaddr, ack, fopts_out, &tx)?;
            Ok(Action::Send {
                txq: choose_tx(engine, link, rxq),
                phy,
            })
        }
        AppResult::Ok => Ok(Action::Nothing),
    }
}

/// Step 7.1: follow what the device's ADR bit and data rate are doing.
fn track_adr(link: &mut Link, frame: &DataFrame, rxq: &RxQ) {
    let adr_flag = frame.fctrl.adr as u8;
    let rx_dr = link.region.datar_to_dr(&rxq.datr);

    match link.adr_use {
        None => {
            link.adr_use = Some(crate::lorawan::region::AdrConfig {
                power: None,
                datr: rx_dr,
                chans: None,
            });
            link.adr_flag_use = adr_flag;
        }
        Some(mut used) => {
            let flag_changed = adr_flag != link.adr_flag_use;
            let dr_changed = rx_dr.is_some() && rx_dr != used.datr;
            if flag_changed {
                link.adr_flag_use = adr_flag;
            }
            if dr_changed {
                used.datr = rx_dr;
                link.adr_use = Some(used);
            }
            if flag_changed || dr_changed {
                // Quality tracking restarts whenever the device moves.
                link.devstat_fcnt = 0;
                link.last_qs.clear();
            }
        }
    }
}

/// RX1 while there is still time to hit it, RX2 otherwise.
fn choose_tx(engine: &MacEngine, link: &Link, rxq: &RxQ) -> TxQ {
    let elapsed = engine.now_ms().saturating_sub(rxq.srvtmst);
    let rx1_deadline = link
        .region
        .rx1_delay(DelayKind::Data)
        .saturating_sub(engine.preprocessing_delay_ms);
    if elapsed < rx1_deadline {
        link.region.rx1_window(&link.rxwin_use, rxq, DelayKind::Data)
    } else {
        link.region.rx2_window(&link.rxwin_use, rxq, DelayKind::Data)
    }
}

/// Frame-counter classification. Returns the class and the 32-bit counter
/// value the frame authenticates under, or `None` when the gap is too
/// large for the configured mode.
fn classify_fcnt(mode: FcntCheck, stored: u32, rx: u16) -> Option<(FcntClass, u32)> {
    // A small counter on a session well past it reads as a device reset
    // when the mode tolerates one. A 16-bit rollover looks identical; the
    // mode choice decides which story to believe.
    if matches!(mode, FcntCheck::ResetAllowed | FcntCheck::Disabled)
        && (rx as u32) < stored
        && rx < MAX_LOST_AFTER_RESET
    {
        return Some((FcntClass::Reset, rx as u32));
    }
    if mode == FcntCheck::Disabled {
        return Some((FcntClass::New, rx as u32));
    }
    if rx == (stored & 0xFFFF) as u16 {
        return Some((FcntClass::Retransmit, stored));
    }
    match mode {
        FcntCheck::Strict32 => {
            let gap = rx.wrapping_sub((stored & 0xFFFF) as u16);
            if gap < MAX_FCNT_GAP {
                Some((FcntClass::New, stored.wrapping_add(gap as u32)))
            } else {
                None
            }
        }
        _ => {
            let gap = rx.wrapping_sub(stored as u16);
            if gap < MAX_FCNT_GAP {
                Some((FcntClass::New, rx as u32))
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_new_and_retransmit() {
        assert_eq!(
            classify_fcnt(FcntCheck::Strict16, 5, 6),
            Some((FcntClass::New, 6))
        );
        assert_eq!(
            classify_fcnt(FcntCheck::Strict16, 6, 6),
            Some((FcntClass::Retransmit, 6))
        );
    }

    #[test]
    fn test_classify_gap_too_large() {
        assert_eq!(classify_fcnt(FcntCheck::Strict16, 1, 0x5000), None);
        assert_eq!(classify_fcnt(FcntCheck::Strict32, 1, 0x5000), None);
    }

    #[test]
    fn test_classify_strict32_rollover() {
        // stored 0x0001FFFF, wire counter rolls to 0x0003
        let (class, fcnt) = classify_fcnt(FcntCheck::Strict32, 0x0001_FFFF, 0x0003).unwrap();
        assert_eq!(class, FcntClass::New);
        assert_eq!(fcnt, 0x0002_0003);
    }

    #[test]
    fn test_classify_strict32_retransmit_past_rollover() {
        assert_eq!(
            classify_fcnt(FcntCheck::Strict32, 0x0001_0007, 0x0007),
            Some((FcntClass::Retransmit, 0x0001_0007))
        );
    }

    #[test]
    fn test_classify_reset() {
        assert_eq!(
            classify_fcnt(FcntCheck::ResetAllowed, 0x0400, 0x0002),
            Some((FcntClass::Reset, 2))
        );
        // at or past the lost-frame bound the reset story is rejected
        assert_eq!(
            classify_fcnt(FcntCheck::ResetAllowed, 0x0400, MAX_LOST_AFTER_RESET),
            None
        );
    }

    #[test]
    fn test_classify_disabled_accepts_anything() {
        assert_eq!(
            classify_fcnt(FcntCheck::Disabled, 1, 0x5000),
            Some((FcntClass::New, 0x5000))
        );
        // small counters still classify as reset
        assert_eq!(
            classify_fcnt(FcntCheck::Disabled, 0x400, 3),
            Some((FcntClass::Reset, 3))
        );
    }
}
