//! Obfuscated HARD_RESET_CLIENT payload for PIA servers

use crate::config::{Cipher, Digest};
use crate::crypto::Prng;

const MAGIC: &[u8] = b"53eo0rk92gxic98p1asgl5auh59r1vp4lmry1e3chzi100qntd";
const KEY_LENGTH: usize = 3;

/// Settings announced to the server before the TLS handshake
#[derive(Debug, Clone)]
pub struct PiaHardReset {
    pub ca_md5_digest: String,
    pub cipher: Cipher,
    pub digest: Digest,
}

impl PiaHardReset {
    pub fn new(ca_md5_digest: impl Into<String>, cipher: Cipher, digest: Digest) -> Self {
        Self {
            ca_md5_digest: ca_md5_digest.into(),
            cipher,
            digest,
        }
    }

    fn settings(&self) -> String {
        format!(
            "crypto\t{}|{}\tca\t{}",
            self.cipher.name().to_lowercase(),
            self.digest.name().to_lowercase(),
            self.ca_md5_digest
        )
    }

    /// Random 3-byte key followed by the XOR-ed magic and settings
    pub fn encode(&self, prng: &dyn Prng) -> Vec<u8> {
        let mut key = [0u8; KEY_LENGTH];
        prng.fill(&mut key);
        self.encode_with_key(key)
    }

    fn encode_with_key(&self, key: [u8; KEY_LENGTH]) -> Vec<u8> {
        let settings = self.settings();
        let mut out = Vec::with_capacity(KEY_LENGTH + MAGIC.len() + settings.len());
        out.extend_from_slice(&key);
        out.extend(
            MAGIC
                .iter()
                .chain(settings.as_bytes())
                .zip(key.iter().cycle())
                .map(|(b, k)| b ^ k),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPrng;

    impl Prng for FixedPrng {
        fn fill(&self, buf: &mut [u8]) {
            buf.iter_mut().enumerate().for_each(|(i, b)| *b = 0x10 + i as u8);
        }
    }

    fn unmask(encoded: &[u8]) -> Vec<u8> {
        let (key, body) = encoded.split_at(KEY_LENGTH);
        body.iter().zip(key.iter().cycle()).map(|(b, k)| b ^ k).collect()
    }

    #[test]
    fn test_payload_layout() {
        let reset = PiaHardReset::new("0123456789abcdef0123456789abcdef", Cipher::Aes128Cbc, Digest::Sha1);
        let encoded = reset.encode(&FixedPrng);
        assert_eq!(&encoded[..KEY_LENGTH], &[0x10, 0x11, 0x12]);

        let plain = String::from_utf8(unmask(&encoded)).unwrap();
        assert_eq!(
            plain,
            "53eo0rk92gxic98p1asgl5auh59r1vp4lmry1e3chzi100qntdcrypto\taes-128-cbc|sha1\tca\t0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn test_key_masks_every_byte() {
        let reset = PiaHardReset::new("ff", Cipher::Aes256Gcm, Digest::Sha256);
        let encoded = reset.encode_with_key([1, 2, 3]);
        assert_eq!(encoded[KEY_LENGTH], b'5' ^ 1);
        assert_eq!(encoded[KEY_LENGTH + 1], b'3' ^ 2);
        assert_eq!(encoded[KEY_LENGTH + 2], b'e' ^ 3);
        assert_eq!(encoded[KEY_LENGTH + 3], b'o' ^ 1);
    }
}
