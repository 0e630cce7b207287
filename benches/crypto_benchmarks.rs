//! Key derivation and data path benchmarks

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ovpn_engine::config::{Cipher, CompressionAlgorithm, CompressionFraming, Digest};
use ovpn_engine::crypto::kdf::{derive_keys, prf, KeyExchange, PrfInput, MASTER_SECRET_LABEL, MASTER_SECRET_LENGTH};
use ovpn_engine::crypto::{zeroing, CipherAlgorithm, CryptoBox, CryptoOptions, StandardCryptoBox};
use ovpn_engine::protocol::data::DataPath;
use std::hint::black_box;

fn pattern(start: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| start.wrapping_add(i as u8)).collect()
}

fn kdf_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("kdf");
    let secret = pattern(0x00, 48);
    let client_seed = pattern(0x40, 32);
    let server_seed = pattern(0x80, 32);

    group.bench_function("prf_master_secret", |b| {
        b.iter(|| {
            let out = prf(&PrfInput {
                label: MASTER_SECRET_LABEL,
                secret: black_box(&secret),
                client_seed: &client_seed,
                server_seed: &server_seed,
                client_session_id: None,
                server_session_id: None,
                size: MASTER_SECRET_LENGTH,
            })
            .unwrap();
            black_box(out);
        });
    });

    let random1 = pattern(0x30, 32);
    let random2 = pattern(0x50, 32);
    let session_id = pattern(0xb0, 8);
    let remote_session_id = pattern(0xc0, 8);
    group.bench_function("derive_keys", |b| {
        b.iter(|| {
            let keys = derive_keys(&KeyExchange {
                pre_master: black_box(&secret),
                random1: &random1,
                random2: &random2,
                server_random1: &client_seed,
                server_random2: &server_seed,
                session_id: &session_id,
                remote_session_id: &remote_session_id,
            })
            .unwrap();
            black_box(keys);
        });
    });

    group.finish();
}

fn crypto_box(cipher: Cipher, enc: u8, dec: u8) -> Box<dyn CryptoBox> {
    let mut crypto = StandardCryptoBox::new();
    crypto
        .configure(CryptoOptions {
            cipher: Some(CipherAlgorithm::Data(cipher)),
            digest: (!cipher.is_aead()).then_some(Digest::Sha256),
            cipher_enc_key: Some(zeroing(&[enc; 64])),
            hmac_enc_key: Some(zeroing(&[enc; 64])),
            cipher_dec_key: Some(zeroing(&[dec; 64])),
            hmac_dec_key: Some(zeroing(&[dec; 64])),
        })
        .unwrap();
    Box::new(crypto)
}

fn path(cipher: Cipher, enc: u8, dec: u8, replay: bool) -> DataPath {
    DataPath::new(
        crypto_box(cipher, enc, dec),
        Some(0),
        CompressionFraming::Disabled,
        CompressionAlgorithm::Disabled,
        replay,
    )
}

fn data_path_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_path");
    let batch: Vec<Bytes> = (0..32).map(|i| Bytes::from(vec![i as u8; 1400])).collect();
    group.throughput(Throughput::Bytes(32 * 1400));

    for cipher in [
        Cipher::Aes128Cbc,
        Cipher::Aes128Gcm,
        Cipher::Aes256Gcm,
        Cipher::ChaCha20Poly1305,
    ] {
        group.bench_with_input(BenchmarkId::new("encrypt", cipher.name()), &cipher, |b, &cipher| {
            let mut client = path(cipher, 1, 2, true);
            b.iter(|| black_box(client.encrypt(0, black_box(&batch)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("decrypt", cipher.name()), &cipher, |b, &cipher| {
            let mut client = path(cipher, 1, 2, false);
            let mut server = path(cipher, 2, 1, false);
            let sealed = client.encrypt(0, &batch).unwrap();
            b.iter(|| black_box(server.decrypt(black_box(&sealed))));
        });
    }

    group.finish();
}

criterion_group!(benches, kdf_benchmark, data_path_benchmark);
criterion_main!(benches);
