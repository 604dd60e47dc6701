//! OTAA join procedure
//!
//! Validates the join-request MIC under the device's AppKey, derives the
//! session keys, assigns a DevAddr under the gateway's NetID and replaces
//! the link atomically. The join-accept is ECB-*decrypted* under the
//! AppKey so the device recovers it by encrypting (LoRaWAN 1.0.1 §6.2.5).

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info};

use crate::error::Error;
use crate::lorawan::crypto::{
    aes128_decrypt_blocks, aes128_encrypt_block, cmac4, pad16, AesKey,
};
use crate::lorawan::region::DelayKind;
use crate::lorawan::{DevAddr, JoinRequest, MType};
use crate::mac::{Action, MacEngine, RxQ};
use crate::store::{Gateway, Link};

/// Join-accept RxDelay field: one second.
const JOIN_RX_DELAY: u8 = 1;

pub(crate) fn handle_join(
    engine: &MacEngine,
    gateway: &Gateway,
    rxq: &RxQ,
    request: &JoinRequest,
    phy: &[u8],
) -> Result<Action, Error> {
    let device = engine
        .store
        .get_device(request.dev_eui)
        .ok_or(Error::UnknownDevEui(request.dev_eui))?;

    if !device.can_join {
        // Provisioned but locked: no reply, no state change.
        info!("ignoring join from non-joinable device {}", request.dev_eui);
        return Ok(Action::Nothing);
    }

    let msg = &phy[..phy.len() - 4];
    if cmac4(&device.appkey, msg) != request.mic {
        return Err(Error::BadMic(request.dev_eui.to_string()));
    }

    let mut app_nonce = [0u8; 3];
    OsRng.fill_bytes(&mut app_nonce);

    let netid = gateway.netid;
    let dev_nonce = request.dev_nonce.to_le_bytes();
    let nwkskey = derive_session_key(&device.appkey, 0x01, &app_nonce, &netid, &dev_nonce);
    let appskey = derive_session_key(&device.appkey, 0x02, &app_nonce, &netid, &dev_nonce);

    let region = device.region;
    let (devaddr, link) = engine.store.atomic(|t| {
        // Reread under the lock; a concurrent join may have raced us.
        let device = t
            .devices
            .get_mut(&request.dev_eui)
            .ok_or(Error::UnknownDevEui(request.dev_eui))?;

        let devaddr = match device.devaddr {
            Some(addr) => {
                // Reused verbatim on re-join; the NwkID bits are not
                // re-validated against the current NetID.
                debug!("reusing DevAddr {} for {}", addr, device.deveui);
                addr
            }
            None => {
                let nwk_id = netid[2] & 0x7F;
                let mut addr;
                loop {
                    let mut low = [0u8; 3];
                    OsRng.fill_bytes(&mut low);
                    addr = DevAddr(
                        (nwk_id as u32) << 25
                            | u32::from_be_bytes([0, low[0], low[1], low[2]]),
                    );
                    if !t.links.contains_key(&addr) {
                        break;
                    }
                }
                addr
            }
        };

        device.devaddr = Some(devaddr);
        device.last_join = Some(Utc::now());

        let link = Link {
            devaddr,
            deveui: Some(device.deveui),
            region,
            binding: device.binding.clone(),
            nwkskey,
            appskey,
            fcntup: 0,
            fcntdown: 0,
            fcnt_check: device.fcnt_check,
            adr_flag_use: 0,
            adr_flag_set: None,
            adr_use: None,
            adr_set: device.adr_set.unwrap_or_else(|| region.default_adr()),
            rxwin_use: device.rxwin_set.unwrap_or_else(|| region.default_rxwin()),
            rxwin_set: device.rxwin_set.unwrap_or_else(|| region.default_rxwin()),
            last_mac: None,
            last_rxq: None,
            devstat: None,
            devstat_fcnt: 0,
            last_qs: vec![],
            last_rx: None,
            last_reset: None,
        };
        t.links.insert(devaddr, link.clone());
        t.pending.remove(&devaddr);
        t.purge_tx_frames(devaddr);

        Ok::<(DevAddr, Link), Error>((devaddr, link))
    })?;

    let app = engine
        .app(&link.binding.app)
        .ok_or_else(|| Error::App(anyhow::anyhow!("no such application {}", link.binding.app)))?;
    app.handle_join(devaddr, &link.binding)?;

    info!(
        "join accepted: DevEUI={} DevAddr={} region={:?}",
        request.dev_eui, devaddr, region
    );

    let phy_out = build_join_accept(&device.appkey, &app_nonce, &netid, devaddr, region.rx2_dr());
    let txq = region.rx1_window(&link.rxwin_use, rxq, DelayKind::Join);
    Ok(Action::Send { txq, phy: phy_out })
}

/// Session-key derivation: AES-ECB of a single zero-padded block.
/// 0x01 leads to NwkSKey, 0x02 to AppSKey.
fn derive_session_key(
    appkey: &AesKey,
    prefix: u8,
    app_nonce: &[u8; 3],
    netid: &[u8; 3],
    dev_nonce: &[u8; 2],
) -> AesKey {
    let mut block = [0u8; 16];
    block[0] = prefix;
    block[1..4].copy_from_slice(app_nonce);
    block[4..7].copy_from_slice(netid);
    block[7..9].copy_from_slice(dev_nonce);
    aes128_encrypt_block(appkey, block)
}

/// Assemble the join-accept PHY payload.
///
/// `MHDR | AppNonce(3) | NetID(3) | DevAddr(reversed) | DLSettings | RxDelay`
/// with the MIC appended, then everything after the MHDR ECB-decrypted.
fn build_join_accept(
    appkey: &AesKey,
    app_nonce: &[u8; 3],
    netid: &[u8; 3],
    devaddr: DevAddr,
    rx2_dr: u8,
) -> Vec<u8> {
    let mhdr = MType::JoinAccept.mhdr();
    let mut macpayload = Vec::with_capacity(12);
    macpayload.extend_from_slice(app_nonce);
    macpayload.extend_from_slice(netid);
    macpayload.extend_from_slice(&devaddr.to_wire());
    // DLSettings: RFU(1) | RX1DROffset(3) | RX2DataRate(4)
    macpayload.push(rx2_dr & 0x0F);
    macpayload.push(JOIN_RX_DELAY);

    let mut mic_input = Vec::with_capacity(1 + macpayload.len());
    mic_input.push(mhdr);
    mic_input.extend_from_slice(&macpayload);
    let mic = cmac4(appkey, &mic_input);

    let mut body = macpayload;
    body.extend_from_slice(&mic);

    let mut phy = Vec::with_capacity(17);
    phy.push(mhdr);
    phy.extend_from_slice(&aes128_decrypt_blocks(appkey, &pad16(&body)));
    phy
}
