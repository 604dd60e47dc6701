//! End-to-end engine scenarios: join, uplink classification, replies and
//! downlink counters, driven through `MacEngine::process_frame` against an
//! in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lora_nexus::app::{AppResult, Application};
use lora_nexus::lorawan::crypto::{
    aes128_encrypt_block, aes128_encrypt_blocks, cmac4, data_mic, payload_cipher, reverse, AesKey,
    Direction,
};
use lora_nexus::lorawan::region::Region;
use lora_nexus::lorawan::{parse_phy, DataFrame, DevAddr, Eui, FCtrl, JoinRequest, MType, Phy};
use lora_nexus::mac::{Action, MacEngine, RxData, RxQ, TxData};
use lora_nexus::maccmd::DefaultMacHandler;
use lora_nexus::store::{
    AppBinding, Device, FcntCheck, Gateway, IgnoredLink, Link, MulticastGroup, PendingTx, Store,
};
use lora_nexus::Error;

const APP_KEY: AesKey = [
    0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F,
    0x3C,
];
const NWK_S_KEY: AesKey = [0x11; 16];
const APP_S_KEY: AesKey = [0x22; 16];
const GW_MAC: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];
const NET_ID: [u8; 3] = [0x00, 0x00, 0x13];
const DEV_EUI: Eui = Eui(0x0000000000000001);
const APP_EUI: Eui = Eui(0x0807060504030201);
const DEV_ADDR: DevAddr = DevAddr(0x26012345);

/// Records every uplink it sees and answers with a scripted result.
struct ScriptedApp {
    result: Mutex<AppResult>,
    seen: Mutex<Vec<RxData>>,
}

impl ScriptedApp {
    fn new(result: AppResult) -> Arc<Self> {
        Arc::new(ScriptedApp {
            result: Mutex::new(result),
            seen: Mutex::new(vec![]),
        })
    }

    fn seen(&self) -> Vec<RxData> {
        self.seen.lock().unwrap().clone()
    }
}

impl Application for ScriptedApp {
    fn handle_join(&self, _devaddr: DevAddr, _binding: &AppBinding) -> anyhow::Result<()> {
        Ok(())
    }

    fn handle_rx(
        &self,
        _devaddr: DevAddr,
        _binding: &AppBinding,
        rx: &RxData,
        _rxq: &RxQ,
    ) -> anyhow::Result<AppResult> {
        self.seen.lock().unwrap().push(rx.clone());
        Ok(self.result.lock().unwrap().clone())
    }
}

fn make_engine(app: Arc<dyn Application>) -> (Arc<Store>, MacEngine) {
    let store = Arc::new(Store::new());
    store.put_gateway(Gateway {
        mac: GW_MAC,
        netid: NET_ID,
        desc: None,
        gps: None,
        alt: None,
        last_rx: None,
    });
    let mut apps: HashMap<String, Arc<dyn Application>> = HashMap::new();
    apps.insert("test".to_string(), app);
    let engine = MacEngine::new(store.clone(), apps, Arc::new(DefaultMacHandler), 50);
    (store, engine)
}

fn provision_device(store: &Store, can_join: bool) {
    store.put_device(Device {
        deveui: DEV_EUI,
        appeui: Some(APP_EUI),
        appkey: APP_KEY,
        can_join,
        region: Region::Eu868,
        binding: AppBinding {
            app: "test".to_string(),
            appid: None,
            appargs: None,
        },
        fcnt_check: FcntCheck::Strict16,
        adr_set: None,
        rxwin_set: None,
        last_join: None,
        devaddr: None,
    });
}

fn provision_link(store: &Store, fcntup: u32, fcnt_check: FcntCheck) {
    let region = Region::Eu868;
    store.put_link(Link {
        devaddr: DEV_ADDR,
        deveui: Some(DEV_EUI),
        region,
        binding: AppBinding {
            app: "test".to_string(),
            appid: None,
            appargs: None,
        },
        nwkskey: NWK_S_KEY,
        appskey: APP_S_KEY,
        fcntup,
        fcntdown: 0,
        fcnt_check,
        adr_flag_use: 0,
        adr_flag_set: None,
        adr_use: None,
        adr_set: region.default_adr(),
        rxwin_use: region.default_rxwin(),
        rxwin_set: region.default_rxwin(),
        last_mac: None,
        last_rxq: None,
        devstat: None,
        devstat_fcnt: 0,
        last_qs: vec![],
        last_rx: None,
        last_reset: None,
    });
}

fn rxq(engine: &MacEngine) -> RxQ {
    RxQ {
        freq: 868.1,
        datr: "SF7BW125".to_string(),
        codr: Some("4/5".to_string()),
        rssi: -65.0,
        lsnr: Some(7.5),
        tmst: 1_000_000,
        srvtmst: engine.now_ms(),
    }
}

fn build_join_request(dev_nonce: u16) -> Vec<u8> {
    let mut phy = JoinRequest {
        app_eui: APP_EUI,
        dev_eui: DEV_EUI,
        dev_nonce,
        mic: [0; 4],
    }
    .serialize();
    let mic = cmac4(&APP_KEY, &phy[..19]);
    phy.truncate(19);
    phy.extend_from_slice(&mic);
    phy
}

fn build_uplink(
    mtype: MType,
    fcnt16: u16,
    fcnt32: u32,
    fport: Option<u8>,
    payload: &[u8],
    fopts: Vec<u8>,
    fctrl: FCtrl,
) -> Vec<u8> {
    let key = match fport {
        Some(0) => &NWK_S_KEY,
        _ => &APP_S_KEY,
    };
    let frm_payload = payload_cipher(key, Direction::Up, DEV_ADDR, fcnt32, payload);
    let mut frame = DataFrame {
        mtype,
        dev_addr: DEV_ADDR,
        fctrl,
        fcnt: fcnt16,
        fopts,
        fport,
        frm_payload,
        mic: [0; 4],
    };
    let msg = frame.serialize_msg();
    frame.mic = data_mic(&NWK_S_KEY, Direction::Up, DEV_ADDR, fcnt32, &msg);
    frame.serialize()
}

fn device_side_keys(app_nonce: &[u8; 3], netid: &[u8; 3], dev_nonce: u16) -> (AesKey, AesKey) {
    let derive = |prefix: u8| {
        let mut block = [0u8; 16];
        block[0] = prefix;
        block[1..4].copy_from_slice(app_nonce);
        block[4..7].copy_from_slice(netid);
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        aes128_encrypt_block(&APP_KEY, block)
    };
    (derive(0x01), derive(0x02))
}

// Scenario 1: join-request happy path.
#[test]
fn join_happy_path() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_device(&store, true);

    let dev_nonce = 0x0042;
    let action = engine
        .process_frame(GW_MAC, rxq(&engine), &build_join_request(dev_nonce))
        .unwrap();

    let (txq, phy) = match action {
        Action::Send { txq, phy } => (txq, phy),
        Action::Nothing => panic!("expected a join-accept"),
    };

    // RX1 with the 5-second join delay
    assert_eq!(txq.tmst, Some(1_000_000 + 5_000_000));
    assert_eq!(txq.freq, 868.1);

    // Device side: ECB-encrypt recovers MACPayload | MIC
    assert_eq!(phy[0], 0x20);
    let body = aes128_encrypt_blocks(&APP_KEY, &phy[1..]);
    let mut mic_input = vec![phy[0]];
    mic_input.extend_from_slice(&body[..12]);
    assert_eq!(&body[12..16], &cmac4(&APP_KEY, &mic_input));

    let mut app_nonce = [0u8; 3];
    app_nonce.copy_from_slice(&body[0..3]);
    assert_eq!(&body[3..6], &NET_ID);
    let devaddr = DevAddr::from_wire([body[6], body[7], body[8], body[9]]);

    // NwkID bits come from the NetID
    assert_eq!(devaddr.nwk_id(), NET_ID[2] & 0x7F);

    // New link with the derived keys and zeroed counters
    let link = store.get_link(devaddr).expect("link after join");
    let (nwkskey, appskey) = device_side_keys(&app_nonce, &NET_ID, dev_nonce);
    assert_eq!(link.nwkskey, nwkskey);
    assert_eq!(link.appskey, appskey);
    assert_eq!(link.fcntup, 0);
    assert_eq!(link.fcntdown, 0);

    let device = store.get_device(DEV_EUI).unwrap();
    assert_eq!(device.devaddr, Some(devaddr));
    assert!(device.last_join.is_some());
}

// Scenario 2: join with a corrupted MIC mutates nothing.
#[test]
fn join_bad_mic() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_device(&store, true);

    let mut phy = build_join_request(0x0042);
    let last = phy.len() - 1;
    phy[last] ^= 0xFF;

    match engine.process_frame(GW_MAC, rxq(&engine), &phy) {
        Err(Error::BadMic(id)) => assert_eq!(id, DEV_EUI.to_string()),
        other => panic!("expected BadMic, got {:?}", other.map(|_| ())),
    }

    let device = store.get_device(DEV_EUI).unwrap();
    assert_eq!(device.devaddr, None);
    assert!(device.last_join.is_none());
    assert!(store.atomic(|t| t.links.is_empty()));
}

#[test]
fn join_from_locked_device_silently_ignored() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_device(&store, false);

    let action = engine
        .process_frame(GW_MAC, rxq(&engine), &build_join_request(1))
        .unwrap();
    assert!(matches!(action, Action::Nothing));
    assert_eq!(store.get_device(DEV_EUI).unwrap().devaddr, None);
}

#[test]
fn join_unknown_deveui() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (_store, engine) = make_engine(app);

    match engine.process_frame(GW_MAC, rxq(&engine), &build_join_request(1)) {
        Err(Error::UnknownDevEui(eui)) => assert_eq!(eui, DEV_EUI),
        other => panic!("expected UnknownDevEui, got {:?}", other.map(|_| ())),
    }
}

// Scenario 3: a new uplink advances the counter, logs the frame and
// reaches the application.
#[test]
fn uplink_new() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app.clone());
    provision_link(&store, 0x0005, FcntCheck::Strict16);

    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0006,
        0x0006,
        Some(1),
        &[0x17],
        vec![],
        FCtrl::default(),
    );
    let action = engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();
    assert!(matches!(action, Action::Nothing));

    let link = store.get_link(DEV_ADDR).unwrap();
    assert_eq!(link.fcntup, 0x0006);
    assert!(link.last_rx.is_some());

    let seen = app.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].fcnt, 6);
    assert_eq!(seen[0].port, Some(1));
    assert_eq!(seen[0].data, vec![0x17]);

    // one RX-log row, holding the plaintext
    store.atomic(|t| {
        assert_eq!(t.rxframes.len(), 1);
        let frame = t.rxframes.values().next().unwrap();
        assert_eq!(frame.data, vec![0x17]);
        assert_eq!(frame.fcnt, 6);
    });
}

// Scenario 4: a replayed frame leaves the counter alone and re-sends the
// pending downlink in RX1.
#[test]
fn uplink_retransmit_resends_pending() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app.clone());
    provision_link(&store, 0x0006, FcntCheck::Strict16);

    let pending_phy = vec![0x60, 1, 2, 3, 4];
    store.put_pending(PendingTx {
        devaddr: DEV_ADDR,
        phy: pending_phy.clone(),
        confirmed: false,
    });

    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0006,
        0x0006,
        Some(1),
        &[0x17],
        vec![],
        FCtrl::default(),
    );
    let action = engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();

    match action {
        Action::Send { txq, phy } => {
            assert_eq!(phy, pending_phy);
            // RX1: one second after the uplink
            assert_eq!(txq.tmst, Some(1_000_000 + 1_000_000));
        }
        Action::Nothing => panic!("expected pending retransmission"),
    }

    assert_eq!(store.get_link(DEV_ADDR).unwrap().fcntup, 0x0006);
    // the application is not re-invoked for a retransmission
    assert!(app.seen().is_empty());
}

// Scenario 5: small counter under reset-allowed reads as a device reset.
#[test]
fn uplink_fcnt_reset() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0x0400, FcntCheck::ResetAllowed);
    store.put_pending(PendingTx {
        devaddr: DEV_ADDR,
        phy: vec![0x60],
        confirmed: true,
    });

    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0002,
        0x0002,
        Some(1),
        &[0x01],
        vec![],
        FCtrl::default(),
    );
    engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();

    let link = store.get_link(DEV_ADDR).unwrap();
    assert_eq!(link.fcntup, 0x0002);
    assert!(link.last_reset.is_some());
    assert_eq!(link.rxwin_use, Region::Eu868.default_rxwin());
    assert!(store.get_pending(DEV_ADDR).is_none());
}

// Scenario 6: counter gap beyond MAX_FCNT_GAP.
#[test]
fn uplink_fcnt_gap_too_large() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0x0001, FcntCheck::Strict16);

    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x5000,
        0x5000,
        Some(1),
        &[0x01],
        vec![],
        FCtrl::default(),
    );
    match engine.process_frame(GW_MAC, rxq(&engine), &phy) {
        Err(Error::FcntGapTooLarge { devaddr, fcnt }) => {
            assert_eq!(devaddr, DEV_ADDR);
            assert_eq!(fcnt, 0x5000);
        }
        other => panic!("expected FcntGapTooLarge, got {:?}", other.map(|_| ())),
    }
    assert_eq!(store.get_link(DEV_ADDR).unwrap().fcntup, 0x0001);
}

// Scenario 7: confirmed uplink answered with application data.
#[test]
fn confirmed_uplink_application_reply() {
    let app = ScriptedApp::new(AppResult::Send(TxData {
        port: Some(2),
        data: b"OK".to_vec(),
        confirmed: false,
        pending: false,
    }));
    let (store, engine) = make_engine(app.clone());
    provision_link(&store, 0x0005, FcntCheck::Strict16);

    let phy = build_uplink(
        MType::ConfirmedDataUp,
        0x0006,
        0x0006,
        Some(1),
        &[0x17],
        vec![],
        FCtrl::default(),
    );
    let action = engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();

    let down_phy = match action {
        Action::Send { phy, .. } => phy,
        Action::Nothing => panic!("expected a downlink"),
    };

    let down = match parse_phy(&down_phy).unwrap() {
        Phy::Data(down) => down,
        other => panic!("expected data downlink, got {}", other),
    };
    assert_eq!(down.mtype, MType::UnconfirmedDataDown);
    assert!(down.fctrl.ack);
    assert_eq!(down.fport, Some(2));
    assert_eq!(down.fcnt, 1);

    // FRMPayload is the reversed ciphertext of the application bytes
    let expected = reverse(&payload_cipher(
        &APP_S_KEY,
        Direction::Down,
        DEV_ADDR,
        1,
        b"OK",
    ));
    assert_eq!(down.frm_payload, expected);

    // MIC verifies under the NwkSKey with the downlink direction
    let msg = down.serialize_msg();
    assert_eq!(
        down.mic,
        data_mic(&NWK_S_KEY, Direction::Down, DEV_ADDR, 1, &msg)
    );

    let link = store.get_link(DEV_ADDR).unwrap();
    assert_eq!(link.fcntdown, 1);

    let pending = store.get_pending(DEV_ADDR).expect("pending after send");
    assert_eq!(pending.phy, down_phy);
    assert!(!pending.confirmed);

    // the app saw shall_reply (confirmed uplink)
    assert!(app.seen()[0].shall_reply);
}

// Scenario 8: FPort 0 with FOpts in the FHDR is malformed.
#[test]
fn fport0_with_fopts_rejected() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0x0005, FcntCheck::Strict16);

    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0006,
        0x0006,
        Some(0),
        &[0x02],
        vec![0x02],
        FCtrl::default(),
    );
    match engine.process_frame(GW_MAC, rxq(&engine), &phy) {
        Err(Error::DoubleFopts) => {}
        other => panic!("expected DoubleFopts, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn uplink_bad_mic_does_not_advance_counter() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0x0005, FcntCheck::Strict16);

    let mut phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0006,
        0x0006,
        Some(1),
        &[0x17],
        vec![],
        FCtrl::default(),
    );
    let last = phy.len() - 1;
    phy[last] ^= 0x01;

    assert!(matches!(
        engine.process_frame(GW_MAC, rxq(&engine), &phy),
        Err(Error::BadMic(_))
    ));
    assert_eq!(store.get_link(DEV_ADDR).unwrap().fcntup, 0x0005);
}

#[test]
fn ignored_devaddr_dropped_before_mic() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0x0005, FcntCheck::Strict16);
    store.atomic(|t| {
        t.ignored.push(IgnoredLink {
            devaddr: DevAddr(0x26000000),
            mask: Some(0xFF000000),
        })
    });

    // garbage MIC: the filter must fire before verification
    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0100,
        0x9999,
        Some(1),
        &[0x17],
        vec![],
        FCtrl::default(),
    );
    let action = engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();
    assert!(matches!(action, Action::Nothing));
}

#[test]
fn unknown_devaddr_rejected() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (_store, engine) = make_engine(app);

    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        1,
        1,
        Some(1),
        &[0x17],
        vec![],
        FCtrl::default(),
    );
    assert!(matches!(
        engine.process_frame(GW_MAC, rxq(&engine), &phy),
        Err(Error::UnknownDevAddr(_))
    ));
}

#[test]
fn unknown_gateway_rejected() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (_store, engine) = make_engine(app);

    assert!(matches!(
        engine.process_frame([0x01; 8], rxq(&engine), &build_join_request(1)),
        Err(Error::UnknownMac(_))
    ));
}

// Counter monotonicity: a run of new uplinks strictly increases fcntup.
#[test]
fn fcntup_monotonic_over_new_uplinks() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0, FcntCheck::Strict16);

    let mut previous = 0;
    for fcnt in [1u16, 2, 5, 9, 100] {
        let phy = build_uplink(
            MType::UnconfirmedDataUp,
            fcnt,
            fcnt as u32,
            Some(1),
            &[fcnt as u8],
            vec![],
            FCtrl::default(),
        );
        engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();
        let now = store.get_link(DEV_ADDR).unwrap().fcntup;
        assert!(now > previous);
        previous = now;
    }
}

// Exactly-once fcntdown: N emissions advance the counter by N.
#[test]
fn fcntdown_advances_exactly_once_per_emission() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0, FcntCheck::Strict16);

    const N: u32 = 5;
    for i in 0..N {
        let action = engine
            .handle_downlink(
                DEV_ADDR,
                None,
                TxData {
                    port: Some(7),
                    data: vec![i as u8],
                    confirmed: false,
                    pending: false,
                },
            )
            .unwrap();
        match action {
            Action::Send { txq, phy } => {
                assert!(txq.imme);
                match parse_phy(&phy).unwrap() {
                    Phy::Data(down) => assert_eq!(down.fcnt, (i + 1) as u16),
                    other => panic!("expected data downlink, got {}", other),
                }
            }
            Action::Nothing => panic!("expected a downlink"),
        }
    }
    assert_eq!(store.get_link(DEV_ADDR).unwrap().fcntdown, N);
}

#[test]
fn multicast_rejects_confirmed() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    let mc_addr = DevAddr(0x26FFFFFF);
    store.atomic(|t| {
        t.multicast.insert(
            mc_addr,
            MulticastGroup {
                devaddr: mc_addr,
                nwkskey: NWK_S_KEY,
                appskey: APP_S_KEY,
                fcntdown: 0,
                region: Region::Eu868,
            },
        )
    });

    assert!(matches!(
        engine.handle_multicast(
            mc_addr,
            None,
            TxData {
                port: Some(1),
                data: vec![1],
                confirmed: true,
                pending: false,
            },
        ),
        Err(Error::NotAllowed)
    ));

    // unconfirmed goes out with ACK clear and no FOpts
    let action = engine
        .handle_multicast(
            mc_addr,
            None,
            TxData {
                port: Some(1),
                data: vec![1],
                confirmed: false,
                pending: false,
            },
        )
        .unwrap();
    match action {
        Action::Send { phy, .. } => match parse_phy(&phy).unwrap() {
            Phy::Data(down) => {
                assert_eq!(down.mtype, MType::UnconfirmedDataDown);
                assert!(!down.fctrl.ack);
                assert!(down.fopts.is_empty());
                assert_eq!(down.fcnt, 1);
            }
            other => panic!("expected data downlink, got {}", other),
        },
        Action::Nothing => panic!("expected a downlink"),
    }
}

// MAC commands in an FPort-0 payload ride under the NwkSKey and reach the
// handler; LinkCheckReq comes back answered in the reply FOpts.
#[test]
fn fport0_link_check_answered() {
    let app = ScriptedApp::new(AppResult::Ok);
    let (store, engine) = make_engine(app);
    provision_link(&store, 0x0005, FcntCheck::Strict16);

    // the handler receives the decrypted commands reversed
    let commands = reverse(&[0x02]);
    let phy = build_uplink(
        MType::UnconfirmedDataUp,
        0x0006,
        0x0006,
        Some(0),
        &commands,
        vec![],
        FCtrl::default(),
    );
    let action = engine.process_frame(GW_MAC, rxq(&engine), &phy).unwrap();

    // a LinkCheckAns forces a reply even though the app had nothing
    let down_phy = match action {
        Action::Send { phy, .. } => phy,
        Action::Nothing => panic!("expected a reply carrying LinkCheckAns"),
    };
    match parse_phy(&down_phy).unwrap() {
        Phy::Data(down) => {
            assert_eq!(down.fport, None);
            assert_eq!(down.fopts[0], 0x02);
        }
        other => panic!("expected data downlink, got {}", other),
    }
}
