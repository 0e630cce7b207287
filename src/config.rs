//! Configuration module for the OpenVPN protocol engine
//!
//! This module provides TOML-based configuration parsing and validation
//! for the session: negotiated algorithms, TLS wrapping keys, keepalive
//! and renegotiation settings, obfuscation and engine timings.

use crate::error::{Result, VpnError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

/// Data channel ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cipher {
    #[serde(rename = "AES-128-CBC")]
    Aes128Cbc,
    #[serde(rename = "AES-192-CBC")]
    Aes192Cbc,
    #[serde(rename = "AES-256-CBC")]
    Aes256Cbc,
    #[serde(rename = "AES-128-GCM")]
    Aes128Gcm,
    #[serde(rename = "AES-192-GCM")]
    Aes192Gcm,
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "CHACHA20-POLY1305")]
    ChaCha20Poly1305,
}

impl Cipher {
    pub const ALL: [Cipher; 7] = [
        Cipher::Aes128Cbc,
        Cipher::Aes192Cbc,
        Cipher::Aes256Cbc,
        Cipher::Aes128Gcm,
        Cipher::Aes192Gcm,
        Cipher::Aes256Gcm,
        Cipher::ChaCha20Poly1305,
    ];

    /// OpenVPN name of the cipher
    pub fn name(self) -> &'static str {
        match self {
            Cipher::Aes128Cbc => "AES-128-CBC",
            Cipher::Aes192Cbc => "AES-192-CBC",
            Cipher::Aes256Cbc => "AES-256-CBC",
            Cipher::Aes128Gcm => "AES-128-GCM",
            Cipher::Aes192Gcm => "AES-192-GCM",
            Cipher::Aes256Gcm => "AES-256-GCM",
            Cipher::ChaCha20Poly1305 => "CHACHA20-POLY1305",
        }
    }

    /// Key length in bytes
    pub fn key_length(self) -> usize {
        match self {
            Cipher::Aes128Cbc | Cipher::Aes128Gcm => 16,
            Cipher::Aes192Cbc | Cipher::Aes192Gcm => 24,
            Cipher::Aes256Cbc | Cipher::Aes256Gcm | Cipher::ChaCha20Poly1305 => 32,
        }
    }

    /// Whether the cipher authenticates on its own (no separate HMAC)
    pub fn is_aead(self) -> bool {
        !matches!(
            self,
            Cipher::Aes128Cbc | Cipher::Aes192Cbc | Cipher::Aes256Cbc
        )
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Cipher {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self> {
        Cipher::ALL
            .into_iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| VpnError::Config(format!("Unknown cipher: {s}")))
    }
}

/// Control channel and CBC data channel digests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Digest {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl Digest {
    pub const ALL: [Digest; 5] = [
        Digest::Sha1,
        Digest::Sha224,
        Digest::Sha256,
        Digest::Sha384,
        Digest::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Digest::Sha1 => "SHA1",
            Digest::Sha224 => "SHA224",
            Digest::Sha256 => "SHA256",
            Digest::Sha384 => "SHA384",
            Digest::Sha512 => "SHA512",
        }
    }

    /// Output length in bytes, also the HMAC key length
    pub fn length(self) -> usize {
        match self {
            Digest::Sha1 => 20,
            Digest::Sha224 => 28,
            Digest::Sha256 => 32,
            Digest::Sha384 => 48,
            Digest::Sha512 => 64,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Digest {
    type Err = VpnError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::ALL
            .into_iter()
            .find(|d| d.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| VpnError::Config(format!("Unknown digest: {s}")))
    }
}

/// How payloads are framed for (stub) compression on the data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionFraming {
    #[default]
    Disabled,
    CompLzo,
    Compress,
    CompressV2,
}

/// Compression algorithm negotiated with the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Disabled,
    Lzo,
    Other,
}

/// Transport of the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    #[default]
    Udp,
    Tcp,
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketType::Udp => f.write_str("UDP"),
            SocketType::Tcp => f.write_str("TCP"),
        }
    }
}

/// Remote server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: SocketType,
}

/// Packet scrambling applied below the OpenVPN framing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum XorMethod {
    XorMask { mask: String },
    XorPtrPos,
    Reverse,
    Obfuscate { mask: String },
}

impl XorMethod {
    /// Mask bytes, empty for the methods that don't use one
    pub fn mask(&self) -> &[u8] {
        match self {
            XorMethod::XorMask { mask } | XorMethod::Obfuscate { mask } => mask.as_bytes(),
            XorMethod::XorPtrPos | XorMethod::Reverse => &[],
        }
    }
}

/// Control channel wrapping strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsWrapStrategy {
    /// HMAC-authenticated control packets (`tls-auth`)
    Auth,
    /// Encrypted control packets (`tls-crypt`)
    Crypt,
}

/// `key-direction` of a static key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticKeyDirection {
    /// key-direction 0
    Server,
    /// key-direction 1
    Client,
}

/// 2048-bit OpenVPN static key made of four 64-byte slots
#[derive(Clone, PartialEq, Eq)]
pub struct StaticKey {
    data: Zeroizing<Vec<u8>>,
    direction: Option<StaticKeyDirection>,
}

impl StaticKey {
    pub const LENGTH: usize = 256;
    const SLOT: usize = 64;
    const BEGIN: &'static str = "-----BEGIN OpenVPN Static key V1-----";
    const END: &'static str = "-----END OpenVPN Static key V1-----";

    pub fn new(data: Vec<u8>, direction: Option<StaticKeyDirection>) -> Result<Self> {
        let data = Zeroizing::new(data);
        if data.len() != Self::LENGTH {
            return Err(VpnError::Config(format!(
                "Static key must be {} bytes, got {}",
                Self::LENGTH,
                data.len()
            )));
        }
        Ok(Self { data, direction })
    }

    /// Parse the "OpenVPN Static key V1" file format, or bare hex
    pub fn from_file_contents(contents: &str, direction: Option<StaticKeyDirection>) -> Result<Self> {
        let body = match (contents.find(Self::BEGIN), contents.find(Self::END)) {
            (Some(begin), Some(end)) if begin < end => &contents[begin + Self::BEGIN.len()..end],
            _ => contents,
        };
        let hex_digits = Zeroizing::new(
            body.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect::<String>(),
        );
        let data = hex::decode(hex_digits.as_bytes())
            .map_err(|e| VpnError::Config(format!("Invalid static key: {e}")))?;
        Self::new(data, direction)
    }

    pub fn direction(&self) -> Option<StaticKeyDirection> {
        self.direction
    }

    fn slot(&self, index: usize) -> &[u8] {
        &self.data[index * Self::SLOT..(index + 1) * Self::SLOT]
    }

    pub fn cipher_encrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(StaticKeyDirection::Server) => self.slot(0),
            Some(StaticKeyDirection::Client) => self.slot(2),
        }
    }

    pub fn cipher_decrypt_key(&self) -> &[u8] {
        match self.direction {
            None | Some(StaticKeyDirection::Client) => self.slot(0),
            Some(StaticKeyDirection::Server) => self.slot(2),
        }
    }

    pub fn hmac_send_key(&self) -> &[u8] {
        match self.direction {
            None | Some(StaticKeyDirection::Server) => self.slot(1),
            Some(StaticKeyDirection::Client) => self.slot(3),
        }
    }

    pub fn hmac_receive_key(&self) -> &[u8] {
        match self.direction {
            None | Some(StaticKeyDirection::Client) => self.slot(1),
            Some(StaticKeyDirection::Server) => self.slot(3),
        }
    }
}

impl fmt::Debug for StaticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKey")
            .field("data", &"<redacted>")
            .field("direction", &self.direction)
            .finish()
    }
}

/// TLS wrapping settings as stored in the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsWrapConfig {
    pub strategy: TlsWrapStrategy,
    /// Path to the static key file
    pub key_path: Option<PathBuf>,
    /// Inline static key, takes precedence over `key_path`
    pub key: Option<String>,
    /// `key-direction`, ignored by `tls-crypt` which always uses the client direction
    pub direction: Option<StaticKeyDirection>,
}

impl TlsWrapConfig {
    /// Load the static key with the direction the strategy requires
    pub fn load_key(&self) -> Result<StaticKey> {
        let direction = match self.strategy {
            TlsWrapStrategy::Auth => self.direction,
            TlsWrapStrategy::Crypt => Some(StaticKeyDirection::Client),
        };
        let contents = match (&self.key, &self.key_path) {
            (Some(inline), _) => Zeroizing::new(inline.clone()),
            (None, Some(path)) => Zeroizing::new(fs::read_to_string(path).map_err(|e| {
                VpnError::Config(format!("Failed to read static key {}: {e}", path.display()))
            })?),
            (None, None) => {
                return Err(VpnError::Config(
                    "TLS wrapping requires a static key".to_string(),
                ))
            }
        };
        StaticKey::from_file_contents(&contents, direction)
    }
}

/// User credentials
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// One-time password appended to the password
    #[serde(default)]
    pub otp: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("otp", &self.otp.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Engine timings, all in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Period of the negotiation check
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Delay between PUSH_REQUEST retries
    #[serde(default = "default_push_request_interval")]
    pub push_request_interval_ms: u64,
    /// Control packet retransmission interval
    #[serde(default = "default_retx_interval")]
    pub retx_interval_ms: u64,
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_ms: u64,
    /// Negotiation timeout while renegotiating
    #[serde(default = "default_soft_negotiation_timeout")]
    pub soft_negotiation_timeout_ms: u64,
    /// Time allowed for the server to answer HARD_RESET_CLIENT
    #[serde(default = "default_hard_reset_timeout")]
    pub hard_reset_timeout_ms: u64,
    #[serde(default = "default_ping_timeout_check_interval")]
    pub ping_timeout_check_interval_ms: u64,
    /// Used when neither the server nor the configuration sets one
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    /// Bound on the exit notification at shutdown
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Minimum delay between data count reports
    #[serde(default = "default_data_count_interval")]
    pub data_count_interval_ms: u64,
    /// Control payload fragment size
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// Reject replayed data packets
    #[serde(default = "default_true")]
    pub uses_replay_protection: bool,
}

impl SessionOptions {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn push_request_interval(&self) -> Duration {
        Duration::from_millis(self.push_request_interval_ms)
    }

    pub fn retx_interval(&self) -> Duration {
        Duration::from_millis(self.retx_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn soft_negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_negotiation_timeout_ms)
    }

    pub fn hard_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_reset_timeout_ms)
    }

    pub fn ping_timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_check_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn data_count_interval(&self) -> Duration {
        Duration::from_millis(self.data_count_interval_ms)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            push_request_interval_ms: default_push_request_interval(),
            retx_interval_ms: default_retx_interval(),
            negotiation_timeout_ms: default_negotiation_timeout(),
            soft_negotiation_timeout_ms: default_soft_negotiation_timeout(),
            hard_reset_timeout_ms: default_hard_reset_timeout(),
            ping_timeout_check_interval_ms: default_ping_timeout_check_interval(),
            ping_timeout_ms: default_ping_timeout(),
            write_timeout_ms: default_write_timeout(),
            data_count_interval_ms: default_data_count_interval(),
            max_packet_size: default_max_packet_size(),
            uses_replay_protection: true,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Server endpoint used by the bundled socket links
    pub remote: Option<Endpoint>,
    /// Cipher used until (or unless) the server pushes one
    #[serde(default)]
    pub cipher: Option<Cipher>,
    /// Ciphers advertised in IV_CIPHERS
    #[serde(default)]
    pub data_ciphers: Vec<Cipher>,
    #[serde(default)]
    pub digest: Option<Digest>,
    #[serde(default)]
    pub compression_framing: CompressionFraming,
    #[serde(default)]
    pub compression_algorithm: CompressionAlgorithm,
    /// CA certificate (PEM)
    pub ca_path: Option<PathBuf>,
    /// Client certificate (PEM)
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM)
    pub client_key_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_wrap: Option<TlsWrapConfig>,
    /// Keepalive ping interval in seconds
    #[serde(default)]
    pub keep_alive_interval: Option<u64>,
    /// Keepalive timeout in seconds
    #[serde(default)]
    pub keep_alive_timeout: Option<u64>,
    /// Renegotiation period in seconds
    #[serde(default)]
    pub renegotiates_after: Option<u64>,
    #[serde(default)]
    pub checks_san_host: bool,
    #[serde(default)]
    pub san_host: Option<String>,
    #[serde(default)]
    pub xor_method: Option<XorMethod>,
    #[serde(default)]
    pub uses_pia_patches: bool,
    /// Extra `KEY=value` peer info lines
    #[serde(default)]
    pub peer_info: Vec<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub options: SessionOptions,
}

impl Configuration {
    pub const FALLBACK_CIPHER: Cipher = Cipher::Aes128Cbc;
    pub const FALLBACK_DIGEST: Digest = Digest::Sha1;

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VpnError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(remote) = &self.remote {
            if remote.address.is_empty() {
                return Err(VpnError::Config(
                    "Remote address cannot be empty".to_string(),
                ));
            }
            if remote.port == 0 {
                return Err(VpnError::Config("Remote port cannot be zero".to_string()));
            }
        }

        if let Some(wrap) = &self.tls_wrap {
            wrap.load_key()?;
        }

        if let Some(method) = &self.xor_method {
            if matches!(method, XorMethod::XorMask { .. } | XorMethod::Obfuscate { .. })
                && method.mask().is_empty()
            {
                return Err(VpnError::Config("XOR mask cannot be empty".to_string()));
            }
        }

        if self.checks_san_host && self.san_host.is_none() {
            return Err(VpnError::Config(
                "SAN host check requires a host name".to_string(),
            ));
        }

        if self.uses_pia_patches && self.ca_path.is_none() {
            return Err(VpnError::Config(
                "PIA patches require a CA certificate".to_string(),
            ));
        }

        if self.client_cert_path.is_some() != self.client_key_path.is_some() {
            return Err(VpnError::Config(
                "Client certificate and key must be provided together".to_string(),
            ));
        }

        if self.options.max_packet_size == 0 {
            return Err(VpnError::Config(
                "Control packet size cannot be zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn fallback_cipher(&self) -> Cipher {
        self.cipher.unwrap_or(Self::FALLBACK_CIPHER)
    }

    pub fn fallback_digest(&self) -> Digest {
        self.digest.unwrap_or(Self::FALLBACK_DIGEST)
    }

    pub fn fallback_compression_framing(&self) -> CompressionFraming {
        self.compression_framing
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            remote: None,
            cipher: Some(Cipher::Aes256Gcm),
            data_ciphers: vec![
                Cipher::Aes256Gcm,
                Cipher::Aes128Gcm,
                Cipher::ChaCha20Poly1305,
            ],
            digest: Some(Digest::Sha256),
            compression_framing: CompressionFraming::Disabled,
            compression_algorithm: CompressionAlgorithm::Disabled,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            tls_wrap: None,
            keep_alive_interval: None,
            keep_alive_timeout: None,
            renegotiates_after: None,
            checks_san_host: false,
            san_host: None,
            xor_method: None,
            uses_pia_patches: false,
            peer_info: Vec::new(),
            credentials: None,
            options: SessionOptions::default(),
        }
    }
}

impl FromStr for Configuration {
    type Err = VpnError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VpnError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    200
}

fn default_push_request_interval() -> u64 {
    2_000
}

fn default_retx_interval() -> u64 {
    100
}

fn default_negotiation_timeout() -> u64 {
    30_000
}

fn default_soft_negotiation_timeout() -> u64 {
    120_000
}

fn default_hard_reset_timeout() -> u64 {
    10_000
}

fn default_ping_timeout_check_interval() -> u64 {
    10_000
}

fn default_ping_timeout() -> u64 {
    120_000
}

fn default_write_timeout() -> u64 {
    5_000
}

fn default_data_count_interval() -> u64 {
    3_000
}

fn default_max_packet_size() -> usize {
    1000
}
