//! String format checks: Stellar account keys, proof hashes, UUIDs.

use once_cell::sync::Lazy;
use regex::Regex;

const STRKEY_LEN: usize = 56;
const ED25519_PUBLIC_KEY_VERSION: u8 = 6 << 3;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

static SHA256_HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-fA-F0-9]{64}$").expect("valid regex"));
static IPFS_CID_V0: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Qm[1-9A-HJ-NP-Za-km-z]{44,}$").expect("valid regex"));
static ARWEAVE_TX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{43}$").expect("valid regex"));

/// Decodes unpadded RFC 4648 base32; `None` on any character outside the alphabet
/// or non-zero trailing bits.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;

    for c in input.bytes() {
        let value = BASE32_ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    (buffer == 0).then_some(out)
}

/// CRC-16/XMODEM (poly `0x1021`, init `0`).
fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ (u16::from(byte) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// Whether `address` is a well-formed Stellar ed25519 public key (`G...`).
///
/// Checks the StrKey envelope: 56 base32 characters decoding to a version
/// byte, a 32-byte key, and a little-endian CRC16 of the first 33 bytes.
pub fn is_stellar_address(address: &str) -> bool {
    if address.len() != STRKEY_LEN {
        return false;
    }
    let Some(decoded) = base32_decode(address) else {
        return false;
    };
    let [version, payload @ .., lo, hi] = decoded.as_slice() else {
        return false;
    };
    if *version != ED25519_PUBLIC_KEY_VERSION || payload.len() != 32 {
        return false;
    }

    let expected = crc16_xmodem(&decoded[..decoded.len() - 2]);
    expected == u16::from_le_bytes([*lo, *hi])
}

/// SHA-256 hex digest, IPFS CIDv0, or Arweave transaction id.
pub fn is_proof_hash(hash: &str) -> bool {
    SHA256_HEX.is_match(hash) || IPFS_CID_V0.is_match(hash) || ARWEAVE_TX.is_match(hash)
}

/// Hyphenated UUID of any version.
pub fn is_uuid(value: &str) -> bool {
    value.len() == 36 && uuid::Uuid::parse_str(value).is_ok()
}
