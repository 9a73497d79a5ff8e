//! Packet cloaking.
//!
//! Cloaking hides the LOB framing from passive observers: each round
//! prepends an 8-byte nonce and XORs the payload with a ChaCha20 keystream
//! under a fixed, public key. It is obfuscation, not encryption. A cloaked
//! frame never starts with `0x00`, which is how it is told apart from a bare
//! LOB packet whose head is shorter than 256 bytes.

use chacha20::ChaCha20Legacy;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;

use crate::constants::CLOAK_NONCE_LENGTH;

const CLOAK_KEY: [u8; 32] = [
    0xd7, 0xf0, 0xe5, 0x55, 0x54, 0x62, 0x41, 0xb2, 0xa7, 0x19, 0xb6, 0xb8, 0xd8, 0xa2, 0xe4, 0xe4,
    0x60, 0x83, 0x3a, 0x2e, 0x0c, 0x5e, 0x1b, 0x59, 0x77, 0x35, 0x31, 0xa4, 0xc1, 0x7f, 0x06, 0xe5,
];

fn apply(nonce: [u8; CLOAK_NONCE_LENGTH], data: &mut [u8]) {
    let mut cipher = ChaCha20Legacy::new(&CLOAK_KEY.into(), &nonce.into());
    cipher.apply_keystream(data);
}

fn random_nonce() -> [u8; CLOAK_NONCE_LENGTH] {
    let mut nonce = [0u8; CLOAK_NONCE_LENGTH];
    let mut rng = rand::thread_rng();
    while nonce[0] == 0 {
        rng.fill_bytes(&mut nonce);
    }
    nonce
}

/// Cloak `data` with the given number of rounds (at least one).
#[must_use]
pub fn cloak(data: &[u8], rounds: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    for _ in 0..rounds.max(1) {
        let nonce = random_nonce();
        apply(nonce, &mut out);
        let mut framed = Vec::with_capacity(CLOAK_NONCE_LENGTH + out.len());
        framed.extend_from_slice(&nonce);
        framed.extend_from_slice(&out);
        out = framed;
    }
    out
}

/// Strip all cloaking rounds.
///
/// Returns the inner bytes and whether at least one round was removed.
#[must_use]
pub fn decloak(data: &[u8]) -> (Vec<u8>, bool) {
    let mut out = data.to_vec();
    let mut cloaked = false;
    while out.len() > CLOAK_NONCE_LENGTH && out[0] != 0 {
        let mut nonce = [0u8; CLOAK_NONCE_LENGTH];
        nonce.copy_from_slice(&out[..CLOAK_NONCE_LENGTH]);
        let mut inner = out.split_off(CLOAK_NONCE_LENGTH);
        apply(nonce, &mut inner);
        out = inner;
        cloaked = true;
    }
    (out, cloaked)
}
