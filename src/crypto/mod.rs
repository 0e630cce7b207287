//! Cryptographic capabilities used by the protocol engine
//!
//! The engine never touches cipher primitives directly. Control channel
//! wrapping and the data path go through a [`CryptoBox`], and the TLS
//! handshake goes through a [`tls::TlsCapability`]. The bundled
//! implementations live in [`standard`] and [`tls`].

use crate::config::{Cipher, Digest};
use crate::error::Result;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;
use zeroize::Zeroizing;

pub mod kdf;
pub mod standard;
pub mod tls;

pub use standard::StandardCryptoBox;

/// Key material whose storage is wiped on drop
pub type ZeroingData = Zeroizing<Vec<u8>>;

/// Copy bytes into a wiped-on-drop buffer
pub fn zeroing(data: &[u8]) -> ZeroingData {
    Zeroizing::new(data.to_vec())
}

/// Cipher selected for a crypto box
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// A data channel cipher
    Data(Cipher),
    /// AES-256-CTR, used by tls-crypt together with an HMAC digest
    Aes256Ctr,
}

impl From<Cipher> for CipherAlgorithm {
    fn from(cipher: Cipher) -> Self {
        CipherAlgorithm::Data(cipher)
    }
}

/// Algorithms and keys a crypto box is configured with
#[derive(Clone, Default)]
pub struct CryptoOptions {
    pub cipher: Option<CipherAlgorithm>,
    pub digest: Option<Digest>,
    pub cipher_enc_key: Option<ZeroingData>,
    pub cipher_dec_key: Option<ZeroingData>,
    pub hmac_enc_key: Option<ZeroingData>,
    pub hmac_dec_key: Option<ZeroingData>,
}

impl fmt::Debug for CryptoOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoOptions")
            .field("cipher", &self.cipher)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// Per-call parameters
///
/// `iv` carries the 4-byte packet id for AEAD ciphers, the implicit part of
/// the nonce comes from the HMAC key. `ad` is the additional authenticated
/// data for AEAD and tls-crypt.
#[derive(Debug, Clone, Copy, Default)]
pub struct CryptoFlags<'a> {
    pub iv: &'a [u8],
    pub ad: &'a [u8],
}

/// Crypto provider capability
///
/// The output layout of [`CryptoBox::encrypt`] depends on the configuration:
/// - digest only: `hmac || data`
/// - AES-256-CTR with digest: `hmac(ad || data) || ctr(data)`
/// - AES-CBC with digest: `hmac(iv || ciphertext) || iv || ciphertext`
/// - AEAD cipher: `tag || ciphertext`
pub trait CryptoBox: Send {
    fn configure(&mut self, options: CryptoOptions) -> Result<()>;

    /// Length of the configured HMAC output, 0 without a digest
    fn digest_length(&self) -> usize;

    /// Length of the authentication prefix produced by `encrypt`
    fn tag_length(&self) -> usize;

    /// The data cipher authenticates the packet header and id itself
    fn is_aead(&self) -> bool;

    fn encrypt(&self, data: &[u8], flags: CryptoFlags<'_>) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8], flags: CryptoFlags<'_>) -> Result<Vec<u8>>;

    /// Check the HMAC prefix of `data` in digest-only mode
    fn verify(&self, data: &[u8], flags: CryptoFlags<'_>) -> Result<()>;
}

/// Builds a fresh, unconfigured crypto box
pub type CryptoBoxFactory = Arc<dyn Fn() -> Box<dyn CryptoBox> + Send + Sync>;

/// The factory for [`StandardCryptoBox`]
pub fn standard_crypto_factory() -> CryptoBoxFactory {
    Arc::new(|| Box::new(StandardCryptoBox::new()) as Box<dyn CryptoBox>)
}

/// Source of random bytes for session ids and key material
pub trait Prng: Send + Sync {
    fn fill(&self, buf: &mut [u8]);

    fn data(&self, length: usize) -> Vec<u8> {
        let mut out = vec![0u8; length];
        self.fill(&mut out);
        out
    }

    fn safe_data(&self, length: usize) -> ZeroingData {
        let mut out = Zeroizing::new(vec![0u8; length]);
        self.fill(&mut out);
        out
    }
}

/// Operating system randomness
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPrng;

impl Prng for SystemPrng {
    fn fill(&self, buf: &mut [u8]) {
        rand::rngs::OsRng.fill_bytes(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prng_fills() {
        let prng = SystemPrng;
        let a = prng.data(32);
        let b = prng.safe_data(32);
        assert_eq!(a.len(), 32);
        assert_eq!(b.len(), 32);
        assert_ne!(a, *b);
    }

    #[test]
    fn test_options_debug_hides_keys() {
        let options = CryptoOptions {
            cipher: Some(CipherAlgorithm::Aes256Ctr),
            digest: Some(Digest::Sha256),
            hmac_enc_key: Some(zeroing(&[0xab; 32])),
            ..Default::default()
        };
        let debug = format!("{options:?}");
        assert!(debug.contains("Aes256Ctr"));
        assert!(!debug.contains("171"));
    }
}
