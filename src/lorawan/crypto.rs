//! LoRaWAN 1.0.1 cryptographic primitives
//!
//! Everything is built on AES-128: ECB single-block operations for key
//! derivation and the join-accept, AES-CMAC truncated to 4 octets for the
//! MIC, and the CTR-like payload cipher keyed by direction, address and
//! frame counter. The payload cipher is its own inverse.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use super::DevAddr;

/// AES-128 key (root or session).
pub type AesKey = [u8; 16];

/// MIC size in bytes.
pub const MIC_SIZE: usize = 4;

const BLOCK_SIZE: usize = 16;

/// Direction byte for the B0/Ai blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to network.
    Up = 0,
    /// Network to device.
    Down = 1,
}

/// AES-128-ECB encrypt of a single block.
pub fn aes128_encrypt_block(key: &AesKey, mut block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let cipher = Aes128::new(key.into());
    cipher.encrypt_block((&mut block).into());
    block
}

/// AES-128-ECB encrypt over consecutive blocks; the input is zero-padded
/// to a block boundary. This is what a device applies to a received
/// join-accept to recover the plaintext.
pub fn aes128_encrypt_blocks(key: &AesKey, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let mut out = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE);
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.encrypt_block((&mut block).into());
        out.extend_from_slice(&block);
    }
    out
}

/// AES-128-ECB decrypt over consecutive blocks, zero-padded.
///
/// The network server *decrypts* the join-accept plaintext so the device,
/// which only implements the encrypt direction, recovers it by encrypting
/// (LoRaWAN 1.0.1 §6.2.5).
pub fn aes128_decrypt_blocks(key: &AesKey, data: &[u8]) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let mut out = Vec::with_capacity(data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE);
    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.decrypt_block((&mut block).into());
        out.extend_from_slice(&block);
    }
    out
}

/// AES-CMAC-128 truncated to the first 4 octets of the tag.
pub fn cmac4(key: &AesKey, msg: &[u8]) -> [u8; MIC_SIZE] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(msg);
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// The B0 authentication block: first block of the MIC input.
///
/// `0x49 | 0x00^4 | Dir | DevAddr(reversed) | FCnt32(LE) | 0x00 | Len`
pub fn block_b0(dir: Direction, dev_addr: DevAddr, fcnt: u32, msg_len: u8) -> [u8; BLOCK_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49;
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_wire());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = msg_len;
    b0
}

/// The Ai cipher block for payload block index i (1-based).
fn block_a(dir: Direction, dev_addr: DevAddr, fcnt: u32, i: u8) -> [u8; BLOCK_SIZE] {
    let mut a = [0u8; BLOCK_SIZE];
    a[0] = 0x01;
    a[5] = dir as u8;
    a[6..10].copy_from_slice(&dev_addr.to_wire());
    a[10..14].copy_from_slice(&fcnt.to_le_bytes());
    a[15] = i;
    a
}

/// Compute the data-frame MIC: CMAC over `B0 | MHDR | MACPayload`.
pub fn data_mic(
    key: &AesKey,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    msg: &[u8],
) -> [u8; MIC_SIZE] {
    let mut input = Vec::with_capacity(BLOCK_SIZE + msg.len());
    input.extend_from_slice(&block_b0(dir, dev_addr, fcnt, msg.len() as u8));
    input.extend_from_slice(msg);
    cmac4(key, &input)
}

/// The LoRaWAN payload cipher. Involutive: applying it twice with the same
/// parameters yields the original payload.
pub fn payload_cipher(
    key: &AesKey,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    payload: &[u8],
) -> Vec<u8> {
    let cipher = Aes128::new(key.into());
    let mut out = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(BLOCK_SIZE).enumerate() {
        let mut s = block_a(dir, dev_addr, fcnt, (i + 1) as u8);
        cipher.encrypt_block((&mut s).into());
        for (j, &byte) in chunk.iter().enumerate() {
            out.push(byte ^ s[j]);
        }
    }
    out
}

/// Zero-right-pad to a multiple of 16 bytes.
pub fn pad16(data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    let rem = out.len() % BLOCK_SIZE;
    if rem != 0 {
        out.resize(out.len() + BLOCK_SIZE - rem, 0);
    }
    out
}

/// Reverse a byte string.
pub fn reverse(data: &[u8]) -> Vec<u8> {
    data.iter().rev().copied().collect()
}
