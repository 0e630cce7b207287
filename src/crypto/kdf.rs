//! OpenVPN key-method 2 key derivation
//!
//! The PRF is the TLS 1.0 construction: the secret is split in two halves,
//! an HMAC-MD5 chain runs over the first and an HMAC-SHA1 chain over the
//! second, and the outputs are XOR-ed.

use super::ZeroingData;
use crate::error::{Result, VpnError};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use zeroize::Zeroizing;

pub const MASTER_SECRET_LABEL: &[u8] = b"OpenVPN master secret";
pub const KEY_EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";
pub const MASTER_SECRET_LENGTH: usize = 48;
/// Length of each of the four keys in the expanded block
pub const KEY_LENGTH: usize = 64;

type HmacMd5 = Hmac<md5::Md5>;
type HmacSha1 = Hmac<sha1::Sha1>;

/// Inputs of one PRF invocation
#[derive(Debug, Clone, Copy)]
pub struct PrfInput<'a> {
    pub label: &'a [u8],
    pub secret: &'a [u8],
    pub client_seed: &'a [u8],
    pub server_seed: &'a [u8],
    pub client_session_id: Option<&'a [u8]>,
    pub server_session_id: Option<&'a [u8]>,
    pub size: usize,
}

impl PrfInput<'_> {
    fn seed(&self) -> Vec<u8> {
        let mut seed = Vec::with_capacity(
            self.label.len() + self.client_seed.len() + self.server_seed.len() + 16,
        );
        seed.extend_from_slice(self.label);
        seed.extend_from_slice(self.client_seed);
        seed.extend_from_slice(self.server_seed);
        if let Some(id) = self.client_session_id {
            seed.extend_from_slice(id);
        }
        if let Some(id) = self.server_session_id {
            seed.extend_from_slice(id);
        }
        seed
    }
}

/// Keys for one direction pair, in wire order of the expanded block
pub struct DerivedKeys {
    pub cipher_enc_key: ZeroingData,
    pub hmac_enc_key: ZeroingData,
    pub cipher_dec_key: ZeroingData,
    pub hmac_dec_key: ZeroingData,
}

/// Random material exchanged during the authentication step
pub struct KeyExchange<'a> {
    pub pre_master: &'a [u8],
    pub random1: &'a [u8],
    pub random2: &'a [u8],
    pub server_random1: &'a [u8],
    pub server_random2: &'a [u8],
    pub session_id: &'a [u8],
    pub remote_session_id: &'a [u8],
}

/// Run the two-hash PRF
pub fn prf(input: &PrfInput<'_>) -> Result<ZeroingData> {
    let seed = input.seed();
    let secret = input.secret;
    let len = secret.len() / 2;
    let lenx = len + (secret.len() & 1);
    let s1 = &secret[..lenx];
    let s2 = &secret[len..len + lenx];

    let mut out = p_hash::<HmacMd5>(s1, &seed, input.size)?;
    let sha1 = p_hash::<HmacSha1>(s2, &seed, input.size)?;
    for (o, s) in out.iter_mut().zip(sha1.iter()) {
        *o ^= s;
    }
    Ok(out)
}

/// Derive the data channel keys from the authentication exchange
pub fn derive_keys(exchange: &KeyExchange<'_>) -> Result<DerivedKeys> {
    let master = prf(&PrfInput {
        label: MASTER_SECRET_LABEL,
        secret: exchange.pre_master,
        client_seed: exchange.random1,
        server_seed: exchange.server_random1,
        client_session_id: None,
        server_session_id: None,
        size: MASTER_SECRET_LENGTH,
    })?;

    let block = prf(&PrfInput {
        label: KEY_EXPANSION_LABEL,
        secret: &master,
        client_seed: exchange.random2,
        server_seed: exchange.server_random2,
        client_session_id: Some(exchange.session_id),
        server_session_id: Some(exchange.remote_session_id),
        size: 4 * KEY_LENGTH,
    })?;

    let key = |index: usize| -> ZeroingData {
        Zeroizing::new(block[index * KEY_LENGTH..(index + 1) * KEY_LENGTH].to_vec())
    };
    Ok(DerivedKeys {
        cipher_enc_key: key(0),
        hmac_enc_key: key(1),
        cipher_dec_key: key(2),
        hmac_dec_key: key(3),
    })
}

fn p_hash<M: Mac + KeyInit>(secret: &[u8], seed: &[u8], size: usize) -> Result<ZeroingData> {
    let hmac = |parts: &[&[u8]]| -> Result<ZeroingData> {
        let mut mac = <M as Mac>::new_from_slice(secret)
            .map_err(|e| VpnError::Crypto(format!("PRF key: {e}")))?;
        for part in parts {
            mac.update(part);
        }
        Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
    };

    let mut out = Zeroizing::new(Vec::with_capacity(size + 20));
    let mut chain = hmac(&[seed])?;
    while out.len() < size {
        out.extend_from_slice(&hmac(&[chain.as_slice(), seed])?);
        chain = hmac(&[chain.as_slice()])?;
    }
    out.truncate(size);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_prf_known_vector() {
        let secret = pattern(0x00, 48);
        let client_seed = pattern(0x40, 32);
        let server_seed = pattern(0x80, 32);
        let out = prf(&PrfInput {
            label: MASTER_SECRET_LABEL,
            secret: &secret,
            client_seed: &client_seed,
            server_seed: &server_seed,
            client_session_id: None,
            server_session_id: None,
            size: MASTER_SECRET_LENGTH,
        })
        .unwrap();
        assert_eq!(hex::encode(&*out), PRF_MASTER_VECTOR);
    }

    #[test]
    fn test_prf_odd_secret_length() {
        let secret = pattern(0x10, 7);
        let input = PrfInput {
            label: b"label",
            secret: &secret,
            client_seed: b"client",
            server_seed: b"server",
            client_session_id: None,
            server_session_id: None,
            size: 50,
        };
        let out = prf(&input).unwrap();
        assert_eq!(out.len(), 50);
        assert_eq!(hex::encode(&*out), PRF_ODD_VECTOR);
    }

    #[test]
    fn test_derive_keys_known_vector() {
        let pre_master = pattern(0x00, 48);
        let random1 = pattern(0x30, 32);
        let random2 = pattern(0x50, 32);
        let server_random1 = pattern(0x70, 32);
        let server_random2 = pattern(0x90, 32);
        let session_id = pattern(0xb0, 8);
        let remote_session_id = pattern(0xc0, 8);

        let exchange = KeyExchange {
            pre_master: &pre_master,
            random1: &random1,
            random2: &random2,
            server_random1: &server_random1,
            server_random2: &server_random2,
            session_id: &session_id,
            remote_session_id: &remote_session_id,
        };
        let keys = derive_keys(&exchange).unwrap();
        assert_eq!(hex::encode(&*keys.cipher_enc_key), KEYS_CIPHER_ENC_VECTOR);
        assert_eq!(hex::encode(&*keys.hmac_dec_key), KEYS_HMAC_DEC_VECTOR);

        let again = derive_keys(&exchange).unwrap();
        assert_eq!(keys.hmac_enc_key, again.hmac_enc_key);
        assert_eq!(keys.cipher_dec_key, again.cipher_dec_key);
        assert_ne!(keys.cipher_enc_key, keys.cipher_dec_key);
    }

    #[test]
    fn test_session_ids_change_key_block() {
        let material = pattern(0x01, 48);
        let seeds = pattern(0x02, 32);
        let a = pattern(0xaa, 8);
        let b = pattern(0xbb, 8);
        let make = |client: &[u8], server: &[u8]| {
            derive_keys(&KeyExchange {
                pre_master: &material,
                random1: &seeds,
                random2: &seeds,
                server_random1: &seeds,
                server_random2: &seeds,
                session_id: client,
                remote_session_id: server,
            })
            .unwrap()
        };
        assert_ne!(make(&a, &b).cipher_enc_key, make(&b, &a).cipher_enc_key);
    }

    const PRF_MASTER_VECTOR: &str = "9999e37f41b205a8183ce835da7daacfd52553e542564d04e4292100b00f5f1fe967f9d4f3888f285a5f119aff451e0d";
    const PRF_ODD_VECTOR: &str = "c4d77ed756c40eb0ea73d985b440244c7f7b6018bf63addfaf0a34941e3d7c950e72203fece168a6fc79fa02c8c1d865627b";
    const KEYS_CIPHER_ENC_VECTOR: &str = "776cd4e0f4a91c4aba3468de473e1d831d2a73ed60249c98df545413a3ec407941a5abab90cda7d1553117534ff8fa1d5cc0410c2c5d172cbf075174eb37f1f5";
    const KEYS_HMAC_DEC_VECTOR: &str = "d3861642c5ac6df8b4c1e9e9bd1516d629a002a3d8c341a82b5dbf2d38a0e3d61b8117f2d8d7cdd9952608506222cdf097697a7bc8a6496f89b20bf2dd5615cc";
}
