//! The `Cryptor` contract and its concrete, production implementation.
//!
//! The authenticated-encryption primitive is treated as an external
//! "NaCl-style `secret_box`" dependency with a narrow interface
//! (`pack`/`open`/`formatWN`/`canStartUnderWorkLabel`). We model that as a
//! trait so the engine never depends on a concrete AEAD, then ship one
//! implementation built on `chacha20poly1305::XChaCha20Poly1305`, 24-byte
//! nonces, 16-byte (`POLY`) tags.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};

use crate::error::{Result, XspError};
use crate::key::SegKey;
use crate::nonce::{Nonce, NONCE_LEN};
use crate::POLY;

/// The authenticated-encryption primitive the engine is built on top of.
///
/// `pack`/`open` operate on bare ciphertext (nonce supplied out of band,
/// e.g. derived per-segment); `format_wn_pack`/`format_wn_open` are the
/// "with nonce" variants used for the header, which prefix the nonce to the
/// ciphertext so it's self-contained on disk.
pub trait Cryptor: Send + Sync {
    fn pack(&self, msg: &[u8], nonce: &Nonce, key: &SegKey) -> Result<Vec<u8>>;
    fn open(&self, ciphertext: &[u8], nonce: &Nonce, key: &SegKey) -> Result<Vec<u8>>;

    fn format_wn_pack(&self, msg: &[u8], nonce: &Nonce, key: &SegKey) -> Result<Vec<u8>> {
        let ct = self.pack(msg, nonce, key)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn format_wn_open(&self, nonce_and_ct: &[u8], key: &SegKey) -> Result<Vec<u8>> {
        if nonce_and_ct.len() < NONCE_LEN {
            return Err(XspError::InputParsing(
                "formatWN payload shorter than a nonce".into(),
            ));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_and_ct[..NONCE_LEN]);
        self.open(&nonce_and_ct[NONCE_LEN..], &nonce, key)
    }

    /// A concurrency-budget hint: how many more `open`/`pack` calls this
    /// cryptor can usefully start right now under the given logical owner
    /// ("work label"). The default of 1 is a conservative single-in-flight
    /// policy; a pooled/hardware-backed cryptor can report higher budgets.
    fn can_start_under_work_label(&self, _label: u64) -> usize {
        1
    }
}

/// `XChaCha20Poly1305`-backed `Cryptor`. `POLY` (16 bytes) matches this
/// AEAD's tag length exactly, so `|ct| = |msg| + POLY` always holds.
#[derive(Default, Clone, Copy)]
pub struct XChaChaCryptor {
    /// Soft cap on concurrent `open` calls per work label; mirrors a
    /// bounded worker pool without actually owning one.
    concurrency_budget: usize,
}

impl XChaChaCryptor {
    pub fn new() -> Self {
        Self {
            concurrency_budget: 8,
        }
    }

    pub fn with_concurrency_budget(budget: usize) -> Self {
        Self {
            concurrency_budget: budget.max(1),
        }
    }
}

impl Cryptor for XChaChaCryptor {
    fn pack(&self, msg: &[u8], nonce: &Nonce, key: &SegKey) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| XspError::Auth(format!("cipher init error: {e}")))?;
        let xnonce = XNonce::from_slice(nonce);
        let ct = cipher
            .encrypt(xnonce, msg)
            .map_err(|e| XspError::Auth(format!("encryption error: {e}")))?;
        debug_assert_eq!(ct.len(), msg.len() + POLY);
        Ok(ct)
    }

    fn open(&self, ciphertext: &[u8], nonce: &Nonce, key: &SegKey) -> Result<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| XspError::Auth(format!("cipher init error: {e}")))?;
        let xnonce = XNonce::from_slice(nonce);
        cipher
            .decrypt(xnonce, ciphertext)
            .map_err(|e| XspError::Auth(format!("authentication failed: {e}")))
    }

    fn can_start_under_work_label(&self, _label: u64) -> usize {
        self.concurrency_budget
    }
}

/// RNG contract: `rng(n) -> bytes` of cryptographically strong
/// randomness, used for segment first-nonces and fresh header nonces.
pub trait SegRng: Send + Sync {
    fn fill(&self, n: usize) -> Vec<u8>;

    fn nonce(&self) -> Nonce {
        let bytes = self.fill(NONCE_LEN);
        let mut out = [0u8; NONCE_LEN];
        out.copy_from_slice(&bytes);
        out
    }
}

/// `rand`-backed RNG, the same crate `deadrop::crypto` already depends on
/// (`rand::rng().fill_bytes`).
#[derive(Default, Clone, Copy)]
pub struct OsRng;

impl SegRng for OsRng {
    fn fill(&self, n: usize) -> Vec<u8> {
        use rand::RngCore;
        let mut buf = vec![0u8; n];
        rand::rng().fill_bytes(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_open_roundtrip() {
        let cryptor = XChaChaCryptor::new();
        let key = SegKey::new([1u8; 32]);
        let nonce = [2u8; NONCE_LEN];
        let msg = b"hello segments";

        let ct = cryptor.pack(msg, &nonce, &key).unwrap();
        assert_eq!(ct.len(), msg.len() + POLY);
        let pt = cryptor.open(&ct, &nonce, &key).unwrap();
        assert_eq!(pt, msg);
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let cryptor = XChaChaCryptor::new();
        let key = SegKey::new([1u8; 32]);
        let nonce = [2u8; NONCE_LEN];
        let mut ct = cryptor.pack(b"hello", &nonce, &key).unwrap();
        ct[0] ^= 0xFF;
        assert!(cryptor.open(&ct, &nonce, &key).is_err());
    }

    #[test]
    fn format_wn_roundtrip() {
        let cryptor = XChaChaCryptor::new();
        let key = SegKey::new([9u8; 32]);
        let nonce = [3u8; NONCE_LEN];
        let msg = b"header plaintext";

        let sealed = cryptor.format_wn_pack(msg, &nonce, &key).unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + msg.len() + POLY);
        let opened = cryptor.format_wn_open(&sealed, &key).unwrap();
        assert_eq!(opened, msg);
    }
}
