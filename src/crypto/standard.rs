//! Crypto box built on ring, with RustCrypto AES for the modes ring lacks
//! (tls-crypt CTR, the CBC data path and AES-192-GCM)

use super::{CipherAlgorithm, CryptoBox, CryptoFlags, CryptoOptions, ZeroingData};
use crate::config::{Cipher, Digest};
use crate::error::{Result, VpnError};
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use ring::{aead, hmac};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type Aes192Gcm = aes_gcm::AesGcm<aes::Aes192, U12>;

const AEAD_TAG_LENGTH: usize = 16;
const AEAD_PACKET_ID_LENGTH: usize = 4;
const AEAD_IMPLICIT_IV_LENGTH: usize = 8;
const CTR_KEY_LENGTH: usize = 32;
const CTR_IV_LENGTH: usize = 16;
const CBC_IV_LENGTH: usize = 16;

enum Mode {
    Unconfigured,
    Hmac {
        digest: Digest,
        enc: Option<hmac::Key>,
        dec: Option<hmac::Key>,
    },
    Ctr {
        digest: Digest,
        enc: Option<(ZeroingData, hmac::Key)>,
        dec: Option<(ZeroingData, hmac::Key)>,
    },
    Cbc {
        cipher: Cipher,
        digest: Digest,
        enc: Option<(ZeroingData, hmac::Key)>,
        dec: Option<(ZeroingData, hmac::Key)>,
    },
    Aead {
        enc: Option<(AeadKey, [u8; AEAD_IMPLICIT_IV_LENGTH])>,
        dec: Option<(AeadKey, [u8; AEAD_IMPLICIT_IV_LENGTH])>,
    },
}

enum AeadKey {
    Ring(aead::LessSafeKey),
    Aes192Gcm(Box<Aes192Gcm>),
}

impl AeadKey {
    fn new(cipher: Cipher, key: &[u8]) -> Result<Self> {
        let invalid = || VpnError::Crypto(format!("Invalid {cipher} key"));
        let algorithm = match cipher {
            Cipher::Aes128Gcm => &aead::AES_128_GCM,
            Cipher::Aes256Gcm => &aead::AES_256_GCM,
            Cipher::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
            Cipher::Aes192Gcm => {
                let key = Aes192Gcm::new_from_slice(key).map_err(|_| invalid())?;
                return Ok(AeadKey::Aes192Gcm(Box::new(key)));
            }
            other => return Err(VpnError::Crypto(format!("Unsupported cipher: {other}"))),
        };
        let unbound = aead::UnboundKey::new(algorithm, key).map_err(|_| invalid())?;
        Ok(AeadKey::Ring(aead::LessSafeKey::new(unbound)))
    }

    /// `tag || ciphertext`
    fn seal(&self, nonce: [u8; aead::NONCE_LEN], ad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let failed = || VpnError::Crypto("AEAD encryption failed".to_string());
        let mut in_out = data.to_vec();
        let mut out = Vec::with_capacity(AEAD_TAG_LENGTH + in_out.len());
        match self {
            AeadKey::Ring(key) => {
                let tag = key
                    .seal_in_place_separate_tag(
                        aead::Nonce::assume_unique_for_key(nonce),
                        aead::Aad::from(ad),
                        &mut in_out,
                    )
                    .map_err(|_| failed())?;
                out.extend_from_slice(tag.as_ref());
            }
            AeadKey::Aes192Gcm(key) => {
                let tag = key
                    .encrypt_in_place_detached(GenericArray::from_slice(&nonce), ad, &mut in_out)
                    .map_err(|_| failed())?;
                out.extend_from_slice(&tag);
            }
        }
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn open(&self, nonce: [u8; aead::NONCE_LEN], ad: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let failed = || VpnError::Crypto("AEAD decryption failed".to_string());
        if data.len() < AEAD_TAG_LENGTH {
            return Err(VpnError::Crypto("Ciphertext shorter than tag".to_string()));
        }
        let (tag, ciphertext) = data.split_at(AEAD_TAG_LENGTH);
        match self {
            AeadKey::Ring(key) => {
                let mut in_out = Vec::with_capacity(data.len());
                in_out.extend_from_slice(ciphertext);
                in_out.extend_from_slice(tag);
                let plain = key
                    .open_in_place(
                        aead::Nonce::assume_unique_for_key(nonce),
                        aead::Aad::from(ad),
                        &mut in_out,
                    )
                    .map_err(|_| failed())?;
                Ok(plain.to_vec())
            }
            AeadKey::Aes192Gcm(key) => {
                let mut plain = ciphertext.to_vec();
                key.decrypt_in_place_detached(
                    GenericArray::from_slice(&nonce),
                    ad,
                    &mut plain,
                    GenericArray::from_slice(tag),
                )
                .map_err(|_| failed())?;
                Ok(plain)
            }
        }
    }
}

/// [`CryptoBox`] for HMAC-only, AES-256-CTR + HMAC, AES-CBC + HMAC and AEAD
/// configurations
pub struct StandardCryptoBox {
    mode: Mode,
}

impl StandardCryptoBox {
    pub fn new() -> Self {
        Self {
            mode: Mode::Unconfigured,
        }
    }
}

impl Default for StandardCryptoBox {
    fn default() -> Self {
        Self::new()
    }
}

fn hmac_algorithm(digest: Digest) -> Result<hmac::Algorithm> {
    match digest {
        Digest::Sha1 => Ok(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY),
        Digest::Sha256 => Ok(hmac::HMAC_SHA256),
        Digest::Sha384 => Ok(hmac::HMAC_SHA384),
        Digest::Sha512 => Ok(hmac::HMAC_SHA512),
        Digest::Sha224 => Err(VpnError::Crypto(format!("Unsupported digest: {digest}"))),
    }
}

fn truncated(key: &[u8], length: usize, what: &str) -> Result<Vec<u8>> {
    key.get(..length)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| VpnError::Crypto(format!("{what} key shorter than {length} bytes")))
}

fn hmac_key(digest: Digest, key: Option<&ZeroingData>) -> Result<Option<hmac::Key>> {
    let algorithm = hmac_algorithm(digest)?;
    key.map(|key| {
        let bytes = ZeroingData::new(truncated(key, digest.length(), "HMAC")?);
        Ok(hmac::Key::new(algorithm, &bytes))
    })
    .transpose()
}

fn aead_key(
    cipher: Cipher,
    key: Option<&ZeroingData>,
    hmac_key: Option<&ZeroingData>,
) -> Result<Option<(AeadKey, [u8; AEAD_IMPLICIT_IV_LENGTH])>> {
    let (Some(key), Some(hmac_key)) = (key, hmac_key) else {
        return Ok(None);
    };
    let bytes = ZeroingData::new(truncated(key, cipher.key_length(), "Cipher")?);
    let key = AeadKey::new(cipher, &bytes)?;
    let mut implicit_iv = [0u8; AEAD_IMPLICIT_IV_LENGTH];
    implicit_iv.copy_from_slice(&truncated(hmac_key, AEAD_IMPLICIT_IV_LENGTH, "HMAC")?);
    Ok(Some((key, implicit_iv)))
}

fn aead_nonce(
    packet_id: &[u8],
    implicit_iv: &[u8; AEAD_IMPLICIT_IV_LENGTH],
) -> Result<[u8; aead::NONCE_LEN]> {
    if packet_id.len() != AEAD_PACKET_ID_LENGTH {
        return Err(VpnError::Crypto(format!(
            "AEAD packet id must be {AEAD_PACKET_ID_LENGTH} bytes"
        )));
    }
    let mut nonce = [0u8; aead::NONCE_LEN];
    nonce[..AEAD_PACKET_ID_LENGTH].copy_from_slice(packet_id);
    nonce[AEAD_PACKET_ID_LENGTH..].copy_from_slice(implicit_iv);
    Ok(nonce)
}

/// Cipher key truncated to `length` paired with its HMAC key
fn keyed_pair(
    digest: Digest,
    length: usize,
    cipher: Option<&ZeroingData>,
    mac: Option<&ZeroingData>,
) -> Result<Option<(ZeroingData, hmac::Key)>> {
    match (cipher, hmac_key(digest, mac)?) {
        (Some(cipher), Some(mac)) => Ok(Some((
            ZeroingData::new(truncated(cipher, length, "Cipher")?),
            mac,
        ))),
        _ => Ok(None),
    }
}

fn ctr_apply(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let mut cipher = Aes256Ctr::new_from_slices(key, iv)
        .map_err(|e| VpnError::Crypto(format!("AES-CTR setup: {e}")))?;
    cipher.apply_keystream(data);
    Ok(())
}

fn cbc_seal<E: KeyIvInit + BlockEncryptMut>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let encryptor =
        E::new_from_slices(key, iv).map_err(|e| VpnError::Crypto(format!("AES-CBC setup: {e}")))?;
    Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(data))
}

fn cbc_open<D: KeyIvInit + BlockDecryptMut>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let decryptor =
        D::new_from_slices(key, iv).map_err(|e| VpnError::Crypto(format!("AES-CBC setup: {e}")))?;
    decryptor
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| VpnError::Crypto("AES-CBC padding is invalid".to_string()))
}

fn cbc_encrypt(cipher: Cipher, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match cipher {
        Cipher::Aes128Cbc => cbc_seal::<cbc::Encryptor<aes::Aes128>>(key, iv, data),
        Cipher::Aes192Cbc => cbc_seal::<cbc::Encryptor<aes::Aes192>>(key, iv, data),
        Cipher::Aes256Cbc => cbc_seal::<cbc::Encryptor<aes::Aes256>>(key, iv, data),
        other => Err(VpnError::Crypto(format!("{other} is not a CBC cipher"))),
    }
}

fn cbc_decrypt(cipher: Cipher, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    match cipher {
        Cipher::Aes128Cbc => cbc_open::<cbc::Decryptor<aes::Aes128>>(key, iv, data),
        Cipher::Aes192Cbc => cbc_open::<cbc::Decryptor<aes::Aes192>>(key, iv, data),
        Cipher::Aes256Cbc => cbc_open::<cbc::Decryptor<aes::Aes256>>(key, iv, data),
        other => Err(VpnError::Crypto(format!("{other} is not a CBC cipher"))),
    }
}

fn missing(direction: &str) -> VpnError {
    VpnError::Crypto(format!("No {direction} key configured"))
}

impl CryptoBox for StandardCryptoBox {
    fn configure(&mut self, options: CryptoOptions) -> Result<()> {
        self.mode = match (options.cipher, options.digest) {
            (None, Some(digest)) => Mode::Hmac {
                digest,
                enc: hmac_key(digest, options.hmac_enc_key.as_ref())?,
                dec: hmac_key(digest, options.hmac_dec_key.as_ref())?,
            },
            (Some(CipherAlgorithm::Aes256Ctr), Some(digest)) => Mode::Ctr {
                digest,
                enc: keyed_pair(
                    digest,
                    CTR_KEY_LENGTH,
                    options.cipher_enc_key.as_ref(),
                    options.hmac_enc_key.as_ref(),
                )?,
                dec: keyed_pair(
                    digest,
                    CTR_KEY_LENGTH,
                    options.cipher_dec_key.as_ref(),
                    options.hmac_dec_key.as_ref(),
                )?,
            },
            (Some(CipherAlgorithm::Data(cipher)), _) if cipher.is_aead() => Mode::Aead {
                enc: aead_key(
                    cipher,
                    options.cipher_enc_key.as_ref(),
                    options.hmac_enc_key.as_ref(),
                )?,
                dec: aead_key(
                    cipher,
                    options.cipher_dec_key.as_ref(),
                    options.hmac_dec_key.as_ref(),
                )?,
            },
            (Some(CipherAlgorithm::Data(cipher)), Some(digest)) => Mode::Cbc {
                cipher,
                digest,
                enc: keyed_pair(
                    digest,
                    cipher.key_length(),
                    options.cipher_enc_key.as_ref(),
                    options.hmac_enc_key.as_ref(),
                )?,
                dec: keyed_pair(
                    digest,
                    cipher.key_length(),
                    options.cipher_dec_key.as_ref(),
                    options.hmac_dec_key.as_ref(),
                )?,
            },
            (cipher, digest) => {
                return Err(VpnError::Crypto(format!(
                    "Invalid combination: cipher {cipher:?}, digest {digest:?}"
                )));
            }
        };
        Ok(())
    }

    fn digest_length(&self) -> usize {
        match &self.mode {
            Mode::Hmac { digest, .. } | Mode::Ctr { digest, .. } | Mode::Cbc { digest, .. } => {
                digest.length()
            }
            Mode::Aead { .. } | Mode::Unconfigured => 0,
        }
    }

    fn tag_length(&self) -> usize {
        match &self.mode {
            Mode::Hmac { digest, .. } | Mode::Ctr { digest, .. } => digest.length(),
            Mode::Cbc { digest, .. } => digest.length() + CBC_IV_LENGTH,
            Mode::Aead { .. } => AEAD_TAG_LENGTH,
            Mode::Unconfigured => 0,
        }
    }

    fn is_aead(&self) -> bool {
        matches!(self.mode, Mode::Aead { .. })
    }

    fn encrypt(&self, data: &[u8], flags: CryptoFlags<'_>) -> Result<Vec<u8>> {
        match &self.mode {
            Mode::Hmac { enc, .. } => {
                let key = enc.as_ref().ok_or_else(|| missing("encryption"))?;
                let tag = hmac::sign(key, data);
                let mut out = Vec::with_capacity(tag.as_ref().len() + data.len());
                out.extend_from_slice(tag.as_ref());
                out.extend_from_slice(data);
                Ok(out)
            }
            Mode::Ctr { enc, .. } => {
                let (cipher_key, mac_key) = enc.as_ref().ok_or_else(|| missing("encryption"))?;
                let mut ctx = hmac::Context::with_key(mac_key);
                ctx.update(flags.ad);
                ctx.update(data);
                let tag = ctx.sign();
                let tag = tag.as_ref();

                let mut out = Vec::with_capacity(tag.len() + data.len());
                out.extend_from_slice(tag);
                out.extend_from_slice(data);
                ctr_apply(cipher_key, &tag[..CTR_IV_LENGTH], &mut out[tag.len()..])?;
                Ok(out)
            }
            Mode::Cbc { cipher, enc, .. } => {
                let (cipher_key, mac_key) = enc.as_ref().ok_or_else(|| missing("encryption"))?;
                let mut iv = [0u8; CBC_IV_LENGTH];
                rand::rngs::OsRng.fill_bytes(&mut iv);
                let ciphertext = cbc_encrypt(*cipher, cipher_key, &iv, data)?;

                let mut ctx = hmac::Context::with_key(mac_key);
                ctx.update(&iv);
                ctx.update(&ciphertext);
                let tag = ctx.sign();

                let mut out =
                    Vec::with_capacity(tag.as_ref().len() + CBC_IV_LENGTH + ciphertext.len());
                out.extend_from_slice(tag.as_ref());
                out.extend_from_slice(&iv);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
            Mode::Aead { enc, .. } => {
                let (key, implicit_iv) = enc.as_ref().ok_or_else(|| missing("encryption"))?;
                key.seal(aead_nonce(flags.iv, implicit_iv)?, flags.ad, data)
            }
            Mode::Unconfigured => Err(VpnError::Crypto("Crypto box not configured".to_string())),
        }
    }

    fn decrypt(&self, data: &[u8], flags: CryptoFlags<'_>) -> Result<Vec<u8>> {
        match &self.mode {
            Mode::Hmac { digest, .. } => {
                self.verify(data, flags)?;
                Ok(data[digest.length()..].to_vec())
            }
            Mode::Ctr { digest, dec, .. } => {
                let (cipher_key, mac_key) = dec.as_ref().ok_or_else(|| missing("decryption"))?;
                let tag_length = digest.length();
                if data.len() < tag_length {
                    return Err(VpnError::Crypto("Ciphertext shorter than tag".to_string()));
                }
                let (tag, ciphertext) = data.split_at(tag_length);
                let mut plain = ciphertext.to_vec();
                ctr_apply(cipher_key, &tag[..CTR_IV_LENGTH], &mut plain)?;

                let mut signed = Vec::with_capacity(flags.ad.len() + plain.len());
                signed.extend_from_slice(flags.ad);
                signed.extend_from_slice(&plain);
                hmac::verify(mac_key, &signed, tag)
                    .map_err(|_| VpnError::Crypto("HMAC verification failed".to_string()))?;
                Ok(plain)
            }
            Mode::Cbc {
                cipher,
                digest,
                dec,
                ..
            } => {
                let (cipher_key, mac_key) = dec.as_ref().ok_or_else(|| missing("decryption"))?;
                let tag_length = digest.length();
                if data.len() < tag_length + CBC_IV_LENGTH {
                    return Err(VpnError::Crypto("Ciphertext shorter than HMAC and IV".to_string()));
                }
                let (tag, sealed) = data.split_at(tag_length);
                hmac::verify(mac_key, sealed, tag)
                    .map_err(|_| VpnError::Crypto("HMAC verification failed".to_string()))?;
                let (iv, ciphertext) = sealed.split_at(CBC_IV_LENGTH);
                cbc_decrypt(*cipher, cipher_key, iv, ciphertext)
            }
            Mode::Aead { dec, .. } => {
                let (key, implicit_iv) = dec.as_ref().ok_or_else(|| missing("decryption"))?;
                key.open(aead_nonce(flags.iv, implicit_iv)?, flags.ad, data)
            }
            Mode::Unconfigured => Err(VpnError::Crypto("Crypto box not configured".to_string())),
        }
    }

    fn verify(&self, data: &[u8], _flags: CryptoFlags<'_>) -> Result<()> {
        match &self.mode {
            Mode::Hmac { digest, dec, .. } => {
                let key = dec.as_ref().ok_or_else(|| missing("decryption"))?;
                let length = digest.length();
                if data.len() < length {
                    return Err(VpnError::Crypto("Data shorter than HMAC".to_string()));
                }
                hmac::verify(key, &data[length..], &data[..length])
                    .map_err(|_| VpnError::Crypto("HMAC verification failed".to_string()))
            }
            _ => Err(VpnError::Crypto(
                "Verification requires a digest-only configuration".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::STATIC_KEY_HEX;
    use crate::config::{StaticKey, StaticKeyDirection};
    use crate::crypto::zeroing;

    const CIPHER_ENC_KEY: &str = "634a4d2d459d606c8e6abbec168fdcd1871462eaa2eaed84c8f403bdf8c7da73";
    const CIPHER_DEC_KEY: &str = "7d81b5774cc35fe0a42b38aa053f1335fd4a22d721880433bbb20ae1f2d88315";
    const HMAC_ENC_KEY: &str = "b2d186b3b377685506fa39d85d38da16c2ecc0d631bda64f9d8f5a8d073f18aa";
    const HMAC_DEC_KEY: &str = "b97ade23e49ea9e7de86784d1ed5fa356df5f7fa1d163e5537efa8d4ba61239d";

    fn key(hex_key: &str) -> Option<ZeroingData> {
        Some(zeroing(&hex::decode(hex_key).unwrap()))
    }

    fn client_server(cipher: Option<CipherAlgorithm>, digest: Option<Digest>) -> (StandardCryptoBox, StandardCryptoBox) {
        let mut client = StandardCryptoBox::new();
        client
            .configure(CryptoOptions {
                cipher,
                digest,
                cipher_enc_key: key(CIPHER_ENC_KEY),
                cipher_dec_key: key(CIPHER_DEC_KEY),
                hmac_enc_key: key(HMAC_ENC_KEY),
                hmac_dec_key: key(HMAC_DEC_KEY),
            })
            .unwrap();
        let mut server = StandardCryptoBox::new();
        server
            .configure(CryptoOptions {
                cipher,
                digest,
                cipher_enc_key: key(CIPHER_DEC_KEY),
                cipher_dec_key: key(CIPHER_ENC_KEY),
                hmac_enc_key: key(HMAC_DEC_KEY),
                hmac_dec_key: key(HMAC_ENC_KEY),
            })
            .unwrap();
        (client, server)
    }

    #[test]
    fn test_bidirectional_key_verifies_hmac() {
        let static_key = StaticKey::new(hex::decode(STATIC_KEY_HEX).unwrap(), None).unwrap();
        let mut sut = StandardCryptoBox::new();
        sut.configure(CryptoOptions {
            digest: Some(Digest::Sha1),
            hmac_enc_key: Some(zeroing(static_key.hmac_receive_key())),
            hmac_dec_key: Some(zeroing(static_key.hmac_send_key())),
            ..Default::default()
        })
        .unwrap();

        let mut data = hex::decode("e67c9137933a412a711c0d0514aca6db6476d17d").unwrap();
        data.extend(hex::decode("000000015b96c94738858fe14742fdae400000000000").unwrap());
        assert!(sut.verify(&data, CryptoFlags::default()).is_ok());

        data[25] ^= 0x01;
        assert!(sut.verify(&data, CryptoFlags::default()).is_err());
    }

    #[test]
    fn test_hmac_encrypt_then_verify() {
        let (client, server) = client_server(None, Some(Digest::Sha256));
        let plain = hex::decode("00112233445566778899").unwrap();
        let signed = client.encrypt(&plain, CryptoFlags::default()).unwrap();
        assert_eq!(signed.len(), 32 + plain.len());
        assert!(server.verify(&signed, CryptoFlags::default()).is_ok());
        assert_eq!(server.decrypt(&signed, CryptoFlags::default()).unwrap(), plain);
    }

    #[test]
    fn test_gcm_encrypt_then_decrypt() {
        let (client, server) = client_server(Some(Cipher::Aes256Gcm.into()), None);
        let flags = CryptoFlags {
            iv: &[0x56, 0x34, 0x12, 0x00],
            ad: &[0x00, 0x12, 0x34, 0x56],
        };
        let plain = hex::decode("00112233445566778899").unwrap();
        let encrypted = client.encrypt(&plain, flags).unwrap();
        assert_eq!(encrypted.len(), AEAD_TAG_LENGTH + plain.len());
        assert_eq!(hex::encode(&encrypted), GCM_VECTOR);
        assert_eq!(server.decrypt(&encrypted, flags).unwrap(), plain);

        let tampered = CryptoFlags {
            ad: &[0x00, 0x12, 0x34, 0x57],
            ..flags
        };
        assert!(server.decrypt(&encrypted, tampered).is_err());
    }

    #[test]
    fn test_ctr_encrypt_then_decrypt() {
        let (client, server) = client_server(Some(CipherAlgorithm::Aes256Ctr), Some(Digest::Sha256));
        let ad = hex::decode("38afa8f1162096081e000000015ba35373").unwrap();
        let flags = CryptoFlags { iv: &[], ad: &ad };
        let plain = hex::decode("0000000000").unwrap();
        let encrypted = client.encrypt(&plain, flags).unwrap();
        assert_eq!(server.decrypt(&encrypted, flags).unwrap(), plain);
    }

    #[test]
    fn test_tls_crypt_known_frame() {
        let data = hex::decode(STATIC_KEY_HEX).unwrap();
        let server_key = StaticKey::new(data, Some(StaticKeyDirection::Server)).unwrap();
        let mut server = StandardCryptoBox::new();
        server
            .configure(CryptoOptions {
                cipher: Some(CipherAlgorithm::Aes256Ctr),
                digest: Some(Digest::Sha256),
                cipher_enc_key: Some(zeroing(server_key.cipher_encrypt_key())),
                cipher_dec_key: Some(zeroing(server_key.cipher_decrypt_key())),
                hmac_enc_key: Some(zeroing(server_key.hmac_send_key())),
                hmac_dec_key: Some(zeroing(server_key.hmac_receive_key())),
            })
            .unwrap();

        let frame = hex::decode("407bf3d6a260e6476d000000015ba4155887940856ddb70e01693980c5c955cb5506ecf9fd3e0bcee0c802ec269427d43bf1cda1837ffbf30c83cacff852cd0b7f4c").unwrap();
        let (ad, sealed) = frame.split_at(17);
        let plain = hex::decode("0100000000a62ec85cc767f0a600000000").unwrap();
        let encrypted = server.encrypt(&plain, CryptoFlags { iv: &[], ad }).unwrap();
        assert_eq!(encrypted, sealed);
    }

    #[test]
    fn test_cbc_encrypt_then_decrypt() {
        let (client, server) = client_server(Some(Cipher::Aes128Cbc.into()), Some(Digest::Sha256));
        assert!(!client.is_aead());
        assert_eq!(client.tag_length(), 32 + CBC_IV_LENGTH);

        let plain = hex::decode("00112233445566778899").unwrap();
        let encrypted = client.encrypt(&plain, CryptoFlags::default()).unwrap();
        assert_eq!(encrypted.len(), 32 + CBC_IV_LENGTH + 16);
        assert_eq!(server.decrypt(&encrypted, CryptoFlags::default()).unwrap(), plain);

        // Random IV per packet
        let again = client.encrypt(&plain, CryptoFlags::default()).unwrap();
        assert_ne!(encrypted, again);

        let mut tampered = encrypted.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        assert!(server.decrypt(&tampered, CryptoFlags::default()).is_err());
        assert!(server.decrypt(&encrypted[..40], CryptoFlags::default()).is_err());
    }

    #[test]
    fn test_cbc_requires_digest() {
        let mut sut = StandardCryptoBox::new();
        let err = sut
            .configure(CryptoOptions {
                cipher: Some(Cipher::Aes256Cbc.into()),
                digest: None,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, VpnError::Crypto(_)));
    }

    #[test]
    fn test_aes192_gcm_encrypt_then_decrypt() {
        let (client, server) = client_server(Some(Cipher::Aes192Gcm.into()), None);
        assert!(client.is_aead());
        let flags = CryptoFlags {
            iv: &[0x00, 0x00, 0x00, 0x07],
            ad: &[0x48, 0x00, 0x00, 0x00, 0x07],
        };
        let plain = hex::decode("00112233445566778899").unwrap();
        let encrypted = client.encrypt(&plain, flags).unwrap();
        assert_eq!(encrypted.len(), AEAD_TAG_LENGTH + plain.len());
        assert_eq!(server.decrypt(&encrypted, flags).unwrap(), plain);

        let mut tampered = encrypted.clone();
        tampered[0] ^= 0x01;
        assert!(server.decrypt(&tampered, flags).is_err());
    }

    #[test]
    fn test_unconfigured_fails() {
        let sut = StandardCryptoBox::new();
        assert!(sut.encrypt(b"data", CryptoFlags::default()).is_err());
        assert_eq!(sut.tag_length(), 0);
    }

    const GCM_VECTOR: &str = "7dcadabb5d3da9d624c986cf986bed60672d14a86a9f6ef27370";
}
