//! Downlink construction
//!
//! Unicast frames allocate the next fcntdown atomically, encrypt the
//! payload under the port-selected session key and persist the finished
//! PHY to the pending table for retransmission. Multicast shares the path
//! but draws keys and counter from the group row, never confirms and
//! carries no FOpts.

use chrono::Utc;
use tracing::debug;

use crate::error::Error;
use crate::lorawan::crypto::{data_mic, payload_cipher, reverse, Direction};
use crate::lorawan::{DataFrame, DevAddr, FCtrl, MType};
use crate::maccmd::MAX_FOPTS_LEN;
use crate::mac::{Action, MacEngine, TxData};
use crate::store::{PendingTx, TxFrame};

/// Build, persist and return a unicast downlink PHY payload.
pub(crate) fn encode_unicast(
    engine: &MacEngine,
    devaddr: DevAddr,
    ack: bool,
    mut fopts: Vec<u8>,
    tx: &TxData,
) -> Result<Vec<u8>, Error> {
    fopts.truncate(MAX_FOPTS_LEN);

    // fcntdown allocation is its own transaction; two concurrent
    // downlinks for one DevAddr get distinct counters.
    let (link, fcntdown) = engine.store.atomic(|t| {
        let link = t
            .links
            .get_mut(&devaddr)
            .ok_or(Error::UnknownDevAddr(devaddr))?;
        link.fcntdown = link.fcntdown.wrapping_add(1);
        Ok::<(crate::store::Link, u32), Error>((link.clone(), link.fcntdown))
    })?;

    let mtype = if tx.confirmed {
        MType::ConfirmedDataDown
    } else {
        MType::UnconfirmedDataDown
    };

    let fctrl = FCtrl {
        adr: matches!(link.adr_flag_set, Some(flag) if flag > 0),
        adr_ack_req: false,
        ack,
        fpending: tx.pending,
    };

    let frm_payload = match tx.port {
        Some(0) => reverse(&payload_cipher(
            &link.nwkskey,
            Direction::Down,
            devaddr,
            fcntdown,
            &tx.data,
        )),
        Some(_) => reverse(&payload_cipher(
            &link.appskey,
            Direction::Down,
            devaddr,
            fcntdown,
            &tx.data,
        )),
        None => vec![],
    };

    let mut frame = DataFrame {
        mtype,
        dev_addr: devaddr,
        fctrl,
        fcnt: (fcntdown & 0xFFFF) as u16,
        fopts,
        fport: if tx.port.is_none() && tx.data.is_empty() {
            None
        } else {
            tx.port
        },
        frm_payload,
        mic: [0; 4],
    };

    let msg = frame.serialize_msg();
    frame.mic = data_mic(&link.nwkskey, Direction::Down, devaddr, fcntdown, &msg);
    let phy = frame.serialize();

    engine.store.atomic(|t| {
        t.pending.insert(
            devaddr,
            PendingTx {
                devaddr,
                phy: phy.clone(),
                confirmed: tx.confirmed,
            },
        );
        t.txframes.push(TxFrame {
            devaddr,
            fcnt: fcntdown,
            port: tx.port,
            data: tx.data.clone(),
            confirmed: tx.confirmed,
            datetime: Utc::now(),
        });
    });

    debug!(
        "downlink built: DevAddr={} FCnt={} confirmed={}",
        devaddr, fcntdown, tx.confirmed
    );
    Ok(phy)
}

/// Build a multicast downlink from a group row.
pub(crate) fn encode_multicast(
    engine: &MacEngine,
    devaddr: DevAddr,
    tx: &TxData,
) -> Result<Vec<u8>, Error> {
    if tx.confirmed {
        return Err(Error::NotAllowed);
    }

    let (group, fcntdown) = engine.store.atomic(|t| {
        let group = t
            .multicast
            .get_mut(&devaddr)
            .ok_or(Error::UnknownDevAddr(devaddr))?;
        group.fcntdown = group.fcntdown.wrapping_add(1);
        Ok::<(crate::store::MulticastGroup, u32), Error>((group.clone(), group.fcntdown))
    })?;

    let fctrl = FCtrl {
        adr: false,
        adr_ack_req: false,
        ack: false,
        fpending: tx.pending,
    };

    let frm_payload = match tx.port {
        Some(0) => reverse(&payload_cipher(
            &group.nwkskey,
            Direction::Down,
            devaddr,
            fcntdown,
            &tx.data,
        )),
        Some(_) => reverse(&payload_cipher(
            &group.appskey,
            Direction::Down,
            devaddr,
            fcntdown,
            &tx.data,
        )),
        None => vec![],
    };

    let mut frame = DataFrame {
        mtype: MType::UnconfirmedDataDown,
        dev_addr: devaddr,
        fctrl,
        fcnt: (fcntdown & 0xFFFF) as u16,
        fopts: vec![],
        fport: if tx.port.is_none() && tx.data.is_empty() {
            None
        } else {
            tx.port
        },
        frm_payload,
        mic: [0; 4],
    };

    let msg = frame.serialize_msg();
    frame.mic = data_mic(&group.nwkskey, Direction::Down, devaddr, fcntdown, &msg);
    Ok(frame.serialize())
}

/// Server-initiated (Class C) unicast: RX2 parameters, FOpts from the
/// MAC-command queue, no ACK.
pub(crate) fn handle_downlink(
    engine: &MacEngine,
    devaddr: DevAddr,
    time: Option<u32>,
    tx: TxData,
) -> Result<Action, Error> {
    let link = engine
        .store
        .get_link(devaddr)
        .ok_or(Error::UnknownDevAddr(devaddr))?;
    let fopts = engine.maccmd.build_fopts(&link);
    let phy = encode_unicast(engine, devaddr, false, fopts, &tx)?;
    let txq = link.region.rf_group(&link.rxwin_use, time);
    Ok(Action::Send { txq, phy })
}

/// Server-initiated multicast on the group's RX2 parameters.
pub(crate) fn handle_multicast(
    engine: &MacEngine,
    devaddr: DevAddr,
    time: Option<u32>,
    tx: TxData,
) -> Result<Action, Error> {
    let group = engine
        .store
        .get_multicast(devaddr)
        .ok_or(Error::UnknownDevAddr(devaddr))?;
    let phy = encode_multicast(engine, devaddr, &tx)?;
    let txq = group.region.rf_group(&group.region.default_rxwin(), time);
    Ok(Action::Send { txq, phy })
}
