//! Cryptographic primitives: HKDF-SHA256 key derivation, AES-256-GCM framing,
//! HMAC-SHA256 tagging, and constant-time comparison.
//!
//! These are pure functions over byte slices so they can be exercised
//! without a running tunnel.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation string for the tunnel key schedule.
const HKDF_INFO: &[u8] = b"secure-proxy-v1";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Minimum length of a valid AEAD frame: `nonce ‖ ciphertext(>=0) ‖ tag`.
pub const MIN_FRAME_LEN: usize = NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext shorter than the minimum frame size")]
    InvalidLength,
    #[error("authentication failed")]
    AuthFailed,
}

/// Derive the send/recv key pair from a 32-byte PSK and the client/server
/// public tokens exchanged during the handshake.
///
/// `salt = client_pub ‖ server_pub` (64 bytes); HKDF-Extract uses the PSK as
/// input keying material. Deterministic for identical inputs.
pub fn derive_keys(psk: &[u8; 32], client_pub: &[u8; 32], server_pub: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_pub);
    salt[32..].copy_from_slice(server_pub);

    let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
    let mut okm = [0u8; 64];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");

    let mut send_key = [0u8; 32];
    let mut recv_key = [0u8; 32];
    send_key.copy_from_slice(&okm[..32]);
    recv_key.copy_from_slice(&okm[32..]);
    (send_key, recv_key)
}

/// Encrypt `plaintext` under `key`, producing `nonce(12) ‖ ciphertext ‖ tag(16)`.
/// Uses a fresh random nonce per call.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("AES-256-GCM encryption over an in-memory buffer cannot fail");

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.append(&mut ciphertext);
    out
}

/// Decrypt a frame produced by [`seal`]. Rejects inputs shorter than
/// [`MIN_FRAME_LEN`] and any tag mismatch.
pub fn open(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CryptoError::InvalidLength);
    }
    let (nonce_bytes, rest) = frame.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).expect("key is exactly 32 bytes");
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, rest)
        .map_err(|_| CryptoError::AuthFailed)
}

/// HMAC-SHA256(key, msg).
pub fn hmac_sha256(key: &[u8; 32], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Constant-time comparison of a computed HMAC-SHA256(key, msg) against `tag`.
pub fn verify_hmac(key: &[u8; 32], msg: &[u8], tag: &[u8]) -> bool {
    let expected = hmac_sha256(key, msg);
    tag.len() == expected.len() && expected.ct_eq(tag).unwrap_u8() == 1
}

/// Decode a hex PSK into exactly 32 raw bytes.
pub fn decode_psk(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic() {
        let psk = [7u8; 32];
        let client_pub = [1u8; 32];
        let server_pub = [2u8; 32];
        let (s1, r1) = derive_keys(&psk, &client_pub, &server_pub);
        let (s2, r2) = derive_keys(&psk, &client_pub, &server_pub);
        assert_eq!(s1, s2);
        assert_eq!(r1, r2);
        assert_ne!(s1, r1, "send and recv keys must differ");
    }

    #[test]
    fn hkdf_differs_with_salt() {
        let psk = [7u8; 32];
        let (s1, _) = derive_keys(&psk, &[1u8; 32], &[2u8; 32]);
        let (s2, _) = derive_keys(&psk, &[1u8; 32], &[3u8; 32]);
        assert_ne!(s1, s2);
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = [9u8; 32];
        for msg in [&b""[..], b"hello", &[0u8; 1000]] {
            let frame = seal(&key, msg);
            let plain = open(&key, &frame).expect("decrypt should succeed");
            assert_eq!(plain, msg);
        }
    }

    #[test]
    fn open_rejects_short_input() {
        let key = [9u8; 32];
        let frame = vec![0u8; MIN_FRAME_LEN - 1];
        assert_eq!(open(&key, &frame), Err(CryptoError::InvalidLength));
    }

    #[test]
    fn open_rejects_tampered_tag() {
        let key = [9u8; 32];
        let mut frame = seal(&key, b"hello world");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert_eq!(open(&key, &frame), Err(CryptoError::AuthFailed));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let frame = seal(&[1u8; 32], b"hello world");
        assert_eq!(open(&[2u8; 32], &frame), Err(CryptoError::AuthFailed));
    }

    #[test]
    fn hmac_verify_roundtrip() {
        let key = [3u8; 32];
        let tag = hmac_sha256(&key, b"auth");
        assert!(verify_hmac(&key, b"auth", &tag));
        assert!(!verify_hmac(&key, b"auth", &hmac_sha256(&[4u8; 32], b"auth")));
        assert!(!verify_hmac(&key, b"other", &tag));
    }

    #[test]
    fn decode_psk_requires_64_hex_chars() {
        assert!(decode_psk(&"ab".repeat(32)).is_some());
        assert!(decode_psk(&"ab".repeat(31)).is_none());
        assert!(decode_psk("not hex").is_none());
    }
}
