//! HMAC-SHA256 signatures for cookie-only session payloads.
//!
//! A signed value is `<payload>.<mac>`, both halves base64url without
//! padding. The MAC covers the encoded payload bytes.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Length of a generated key in bytes.
pub const RANDOM_KEY_LEN: usize = 32;

const BLOCK_SIZE: usize = 64;
const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5C;

/// Signs and verifies cookie values with a secret key.
#[derive(Clone)]
pub struct CookieSigner {
    key: Vec<u8>,
}

impl CookieSigner {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    /// A signer with a fresh process-local key. Cookies it signs stop
    /// verifying once the process exits.
    pub fn random() -> Self {
        let mut key = vec![0u8; RANDOM_KEY_LEN];
        rand::thread_rng().fill(&mut key[..]);
        Self { key }
    }

    /// Appends the MAC of `payload`.
    pub fn sign(&self, payload: &str) -> String {
        let mac = URL_SAFE_NO_PAD.encode(self.mac(payload.as_bytes()));
        format!("{payload}.{mac}")
    }

    /// Returns the payload half of `value` if its MAC matches.
    pub fn verify<'a>(&self, value: &'a str) -> Option<&'a str> {
        let (payload, mac) = value.rsplit_once('.')?;
        let given = URL_SAFE_NO_PAD.decode(mac).ok()?;
        constant_time_eq(&self.mac(payload.as_bytes()), &given).then_some(payload)
    }

    fn mac(&self, data: &[u8]) -> [u8; 32] {
        let mut block = [0u8; BLOCK_SIZE];
        if self.key.len() > BLOCK_SIZE {
            block[..32].copy_from_slice(&Sha256::digest(&self.key));
        } else {
            block[..self.key.len()].copy_from_slice(&self.key);
        }

        let inner_pad = block.map(|b| b ^ IPAD);
        let outer_pad = block.map(|b| b ^ OPAD);

        let inner = Sha256::new().chain_update(inner_pad).chain_update(data).finalize();
        Sha256::new()
            .chain_update(outer_pad)
            .chain_update(inner)
            .finalize()
            .into()
    }
}

impl fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
