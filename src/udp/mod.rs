//! Semtech UDP Packet Forwarder server
//!
//! Receives PUSH_DATA/PULL_DATA from gateways, acknowledges immediately,
//! hands every rxpk to the MAC engine and answers engine `Send` actions
//! with PULL_RESP datagrams. Downlinks go to the address a gateway last
//! pulled from; a gateway that has never pulled cannot be scheduled.

pub mod protocol;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use base64::Engine;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::mac::{Action, MacEngine, RxQ, TxQ};
use crate::store::GatewayMac;
use protocol::{parse_upstream, PushBody, Rxpk, Txpk, Upstream};

/// Handle for sending PULL_RESP downlinks, usable from outside the recv
/// loop (Class C, multicast).
#[derive(Clone)]
pub struct DownlinkSender {
    socket: Arc<UdpSocket>,
    pulls: Arc<Mutex<HashMap<GatewayMac, SocketAddr>>>,
}

impl DownlinkSender {
    /// Send a transmit order to a gateway. Fails when the gateway has not
    /// announced a pull address yet.
    pub async fn send_downlink(
        &self,
        gateway: GatewayMac,
        txq: &TxQ,
        phy: &[u8],
    ) -> anyhow::Result<()> {
        let addr = {
            let pulls = self.pulls.lock().expect("pull table lock poisoned");
            pulls.get(&gateway).copied()
        };
        let addr = addr.ok_or_else(|| {
            anyhow::anyhow!("gateway {} has no pull address", hex::encode(gateway))
        })?;

        let datagram = protocol::pull_resp(rand::random(), &Txpk::from_phy(txq, phy))?;
        self.socket.send_to(&datagram, addr).await?;
        debug!(
            "PULL_RESP to {} ({} bytes, freq={} datr={})",
            hex::encode(gateway),
            phy.len(),
            txq.freq,
            txq.datr
        );
        Ok(())
    }
}

/// Start the UDP server. Returns a sender handle; the recv loop runs in a
/// background task.
pub async fn start_server(
    config: &Config,
    engine: Arc<MacEngine>,
) -> anyhow::Result<DownlinkSender> {
    let socket = Arc::new(UdpSocket::bind(&config.udp.bind).await?);
    info!("UDP server listening on {}", config.udp.bind);

    let sender = DownlinkSender {
        socket: socket.clone(),
        pulls: Arc::new(Mutex::new(HashMap::new())),
    };

    let loop_sender = sender.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(e) => {
                    error!("UDP recv error: {}", e);
                    continue;
                }
            };
            debug!("Received {} bytes from {}", len, src);

            match parse_upstream(&buf[..len]) {
                Ok(packet) => {
                    let engine = engine.clone();
                    let sender = loop_sender.clone();
                    tokio::spawn(async move {
                        handle_packet(engine, sender, src, packet).await;
                    });
                }
                Err(e) => {
                    warn!("Failed to parse GWMP packet from {}: {}", src, e);
                }
            }
        }
    });

    Ok(sender)
}

async fn handle_packet(
    engine: Arc<MacEngine>,
    sender: DownlinkSender,
    src: SocketAddr,
    packet: Upstream,
) {
    match packet {
        Upstream::PushData { token, mac, json } => {
            let gw_hex = hex::encode(mac);
            debug!("PUSH_DATA from gateway {} (token: 0x{:04x})", gw_hex, token);

            // Ack first; processing happens after.
            if let Err(e) = sender.socket.send_to(&protocol::push_ack(token), src).await {
                error!("Failed to send PUSH_ACK to {}: {}", src, e);
            }

            match serde_json::from_str::<PushBody>(&json) {
                Ok(body) => {
                    if let Some(rxpks) = body.rxpk {
                        for rxpk in rxpks {
                            process_rxpk(&engine, &sender, mac, rxpk).await;
                        }
                    }
                    if let Some(stat) = body.stat {
                        if let Err(e) = engine.process_status(mac, stat) {
                            warn!("status from {} rejected: {}", gw_hex, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to parse PUSH_DATA JSON: {}", e);
                    debug!("  Raw JSON: {}", json);
                }
            }
        }
        Upstream::PullData { token, mac } => {
            debug!(
                "PULL_DATA from gateway {} (token: 0x{:04x})",
                hex::encode(mac),
                token
            );

            {
                let mut pulls = sender.pulls.lock().expect("pull table lock poisoned");
                pulls.insert(mac, src);
            }

            if let Err(e) = sender.socket.send_to(&protocol::pull_ack(token), src).await {
                error!("Failed to send PULL_ACK to {}: {}", src, e);
            }
        }
        Upstream::TxAck { token, mac, json } => {
            debug!(
                "TX_ACK from gateway {} (token: 0x{:04x}): {:?}",
                hex::encode(mac),
                token,
                json
            );
        }
    }
}

async fn process_rxpk(
    engine: &MacEngine,
    sender: &DownlinkSender,
    gateway_mac: GatewayMac,
    rxpk: Rxpk,
) {
    debug!(
        "  rxpk: freq={} MHz, rssi={} dBm, datr={}, size={} bytes",
        rxpk.freq, rxpk.rssi, rxpk.datr, rxpk.size
    );

    let phy = match base64_decode(&rxpk.data) {
        Ok(phy) => phy,
        Err(e) => {
            warn!("  Failed to base64 decode rxpk data: {}", e);
            return;
        }
    };

    let rxq = RxQ {
        freq: rxpk.freq,
        datr: rxpk.datr,
        codr: rxpk.codr,
        rssi: rxpk.rssi,
        lsnr: rxpk.lsnr,
        tmst: rxpk.tmst,
        srvtmst: engine.now_ms(),
    };

    match engine.process_frame(gateway_mac, rxq, &phy) {
        Ok(Action::Send { txq, phy }) => {
            if let Err(e) = sender.send_downlink(gateway_mac, &txq, &phy).await {
                warn!("  Downlink dropped: {}", e);
            }
        }
        Ok(Action::Nothing) => {}
        Err(e) => {
            warn!("  Frame rejected: {}", e);
        }
    }
}

fn base64_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(input)
        .map_err(|e| anyhow::anyhow!("Base64 decode error: {}", e))
}
