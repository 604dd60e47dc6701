//! Gateway Simulator
//!
//! Simulates a LoRa gateway plus one OTAA device against a running
//! lora-nexus server: performs a cryptographically valid join, derives
//! the session keys from the join-accept exactly as the device would,
//! then sends an encrypted confirmed uplink and prints what comes back.
//!
//! Usage: cargo run --bin gateway-sim [server_addr]
//!
//! The server must have a gateway AABBCCDDEEFF0011 (NetID 000013) and a
//! device DevEUI 0000000000000001 with the AppKey below provisioned.

use std::env;
use std::net::SocketAddr;

use base64::Engine;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Duration};

use lora_nexus::lorawan::crypto::{
    aes128_encrypt_block, aes128_encrypt_blocks, cmac4, data_mic, payload_cipher, AesKey,
    Direction,
};
use lora_nexus::lorawan::{parse_phy, DataFrame, DevAddr, Eui, FCtrl, JoinRequest, MType, Phy};

const PROTOCOL_VERSION: u8 = 0x02;
const PUSH_DATA: u8 = 0x00;
const PULL_DATA: u8 = 0x02;
const PULL_RESP: u8 = 0x03;

/// Fake gateway MAC, must match the provisioned gateway.
const GATEWAY_MAC: [u8; 8] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];

const APP_KEY: AesKey = [
    0x2B, 0x7E, 0x15, 0x16, 0x28, 0xAE, 0xD2, 0xA6, 0xAB, 0xF7, 0x15, 0x88, 0x09, 0xCF, 0x4F,
    0x3C,
];
const DEV_EUI: Eui = Eui(0x0000000000000001);
const APP_EUI: Eui = Eui(0x0807060504030201);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_addr: SocketAddr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1680".to_string())
        .parse()?;

    println!("📡 lora-nexus Gateway Simulator");
    println!("  Target: {}", server_addr);
    println!("  Gateway MAC: {}", hex::encode(GATEWAY_MAC));
    println!("  DevEUI: {}", DEV_EUI);
    println!();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server_addr).await?;
    let mut token: u16 = 0;

    // Announce a pull address so the server can send us PULL_RESPs
    token = token.wrapping_add(1);
    socket.send(&build_pull_data(token)).await?;
    expect_ack(&socket, "PULL_ACK").await;

    // --- Join ---
    let dev_nonce: u16 = rand::random();
    let join_request = JoinRequest {
        app_eui: APP_EUI,
        dev_eui: DEV_EUI,
        dev_nonce,
        mic: [0; 4],
    };
    let mut phy = join_request.serialize();
    let mic = cmac4(&APP_KEY, &phy[..19]);
    phy.truncate(19);
    phy.extend_from_slice(&mic);

    println!("🚀 Sending JoinRequest (DevNonce={})", dev_nonce);
    token = token.wrapping_add(1);
    socket.send(&build_push_data(token, &rxpk_json(&phy))).await?;
    expect_ack(&socket, "PUSH_ACK").await;

    let accept_phy = wait_pull_resp(&socket).await?;
    let (devaddr, nwkskey, appskey) = decode_join_accept(&accept_phy, dev_nonce)?;
    println!("✅ Joined! DevAddr={}", devaddr);

    sleep(Duration::from_millis(500)).await;

    // --- Confirmed uplink ---
    // A frame counter equal to the stored one reads as a retransmission,
    // so the first data uplink goes out with FCnt=1.
    let payload = b"hello";
    let fcnt: u32 = 1;
    let mut frame = DataFrame {
        mtype: MType::ConfirmedDataUp,
        dev_addr: devaddr,
        fctrl: FCtrl::default(),
        fcnt: fcnt as u16,
        fopts: vec![],
        fport: Some(1),
        frm_payload: payload_cipher(&appskey, Direction::Up, devaddr, fcnt, payload),
        mic: [0; 4],
    };
    let msg = frame.serialize_msg();
    frame.mic = data_mic(&nwkskey, Direction::Up, devaddr, fcnt, &msg);

    println!("🚀 Sending ConfirmedDataUp (FCnt={}, {:?})", fcnt, String::from_utf8_lossy(payload));
    token = token.wrapping_add(1);
    socket
        .send(&build_push_data(token, &rxpk_json(&frame.serialize())))
        .await?;
    expect_ack(&socket, "PUSH_ACK").await;

    match wait_pull_resp(&socket).await {
        Ok(down_phy) => match parse_phy(&down_phy) {
            Ok(Phy::Data(down)) => {
                println!(
                    "✅ Downlink: {} ACK={} FCnt={}",
                    down.mtype, down.fctrl.ack, down.fcnt
                );
            }
            Ok(other) => println!("⚠️  Unexpected downlink: {}", other),
            Err(e) => println!("❌ Bad downlink: {}", e),
        },
        Err(e) => println!("⏰ No downlink: {}", e),
    }

    println!();
    println!("✨ Simulation complete!");
    Ok(())
}

/// Device-side join-accept processing: ECB-encrypt the body, verify the
/// MIC, derive the session keys.
fn decode_join_accept(phy: &[u8], dev_nonce: u16) -> anyhow::Result<(DevAddr, AesKey, AesKey)> {
    let encrypted = match parse_phy(phy)? {
        Phy::JoinAccept { encrypted } => encrypted,
        other => anyhow::bail!("expected JoinAccept, got {}", other),
    };

    let body = aes128_encrypt_blocks(&APP_KEY, &encrypted);
    if body.len() < 16 {
        anyhow::bail!("join-accept body too short");
    }

    let mut mic_input = vec![phy[0]];
    mic_input.extend_from_slice(&body[..12]);
    let mic = cmac4(&APP_KEY, &mic_input);
    if body[12..16] != mic {
        anyhow::bail!("join-accept MIC mismatch");
    }

    let mut app_nonce = [0u8; 3];
    app_nonce.copy_from_slice(&body[0..3]);
    let mut netid = [0u8; 3];
    netid.copy_from_slice(&body[3..6]);
    let devaddr = DevAddr::from_wire([body[6], body[7], body[8], body[9]]);

    let nwkskey = derive_key(0x01, &app_nonce, &netid, dev_nonce);
    let appskey = derive_key(0x02, &app_nonce, &netid, dev_nonce);
    Ok((devaddr, nwkskey, appskey))
}

fn derive_key(prefix: u8, app_nonce: &[u8; 3], netid: &[u8; 3], dev_nonce: u16) -> AesKey {
    let mut block = [0u8; 16];
    block[0] = prefix;
    block[1..4].copy_from_slice(app_nonce);
    block[4..7].copy_from_slice(netid);
    block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    aes128_encrypt_block(&APP_KEY, block)
}

async fn expect_ack(socket: &UdpSocket, kind: &str) {
    let mut buf = [0u8; 64];
    match timeout(Duration::from_secs(2), socket.recv(&mut buf)).await {
        Ok(Ok(len)) if len >= 4 => println!("   ✅ {} received", kind),
        Ok(Ok(len)) => println!("   ⚠️  Short response ({} bytes)", len),
        Ok(Err(e)) => println!("   ❌ Recv error: {}", e),
        Err(_) => println!("   ⏰ No {} (timeout)", kind),
    }
}

/// Wait for a PULL_RESP and return the PHY payload from its txpk.
async fn wait_pull_resp(socket: &UdpSocket) -> anyhow::Result<Vec<u8>> {
    let mut buf = vec![0u8; 4096];
    loop {
        let len = timeout(Duration::from_secs(8), socket.recv(&mut buf)).await??;
        if len < 4 || buf[0] != PROTOCOL_VERSION || buf[3] != PULL_RESP {
            continue;
        }
        let json: serde_json::Value = serde_json::from_slice(&buf[4..len])?;
        let data = json["txpk"]["data"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("txpk without data"))?;
        let phy = base64::engine::general_purpose::STANDARD.decode(data)?;
        println!(
            "   📥 PULL_RESP: {} bytes, freq={} datr={}",
            phy.len(),
            json["txpk"]["freq"],
            json["txpk"]["datr"]
        );
        return Ok(phy);
    }
}

fn build_push_data(token: u16, json: &str) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.push(PROTOCOL_VERSION);
    packet.push((token >> 8) as u8);
    packet.push(token as u8);
    packet.push(PUSH_DATA);
    packet.extend_from_slice(&GATEWAY_MAC);
    packet.extend_from_slice(json.as_bytes());
    packet
}

fn build_pull_data(token: u16) -> Vec<u8> {
    let mut packet = Vec::new();
    packet.push(PROTOCOL_VERSION);
    packet.push((token >> 8) as u8);
    packet.push(token as u8);
    packet.push(PULL_DATA);
    packet.extend_from_slice(&GATEWAY_MAC);
    packet
}

fn rxpk_json(phy: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(phy);
    format!(
        r#"{{"rxpk":[{{"tmst":1000000,"freq":868.1,"rssi":-65,"lsnr":7.5,"datr":"SF7BW125","codr":"4/5","size":{},"data":"{}"}}]}}"#,
        phy.len(),
        b64
    )
}
