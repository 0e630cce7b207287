//! Key-method 2 authentication exchange
//!
//! Once TLS is up the client sends its random material, options string,
//! credentials and peer info. The server answers with its own random
//! material and options, then with NUL-separated control messages
//! (`PUSH_REPLY`, `AUTH_FAILED`, `RESTART`...).

use crate::config::{CompressionFraming, Configuration, StaticKeyDirection, TlsWrapStrategy};
use crate::crypto::kdf::{KeyExchange, MASTER_SECRET_LENGTH};
use crate::crypto::tls::TlsCapability;
use crate::crypto::{zeroing, Prng, ZeroingData};
use crate::error::{Result, VpnError};
use log::{debug, info};
use zeroize::Zeroizing;

/// Leading bytes of both auth messages: reserved u32 then key method 2
pub const TLS_PREFIX: [u8; 5] = [0x00, 0x00, 0x00, 0x00, 0x02];
pub const RANDOM_LENGTH: usize = 32;
const SIZE_LENGTH: usize = 2;

fn append_sized(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
    buf.extend_from_slice(data);
}

fn null_terminated(text: &str) -> ZeroingData {
    let mut out = Zeroizing::new(Vec::with_capacity(text.len() + 1));
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out
}

fn platform() -> &'static str {
    match std::env::consts::OS {
        "macos" => "mac",
        "windows" => "win",
        other => other,
    }
}

/// Peer info block advertised to the server
pub fn peer_info(configuration: &Configuration, ssl_version: Option<&str>) -> String {
    let mut lines = vec![
        "IV_VER=2.4".to_string(),
        format!("IV_UI_VER={} {}", crate::NAME, crate::VERSION),
        "IV_PROTO=2".to_string(),
        "IV_NCP=2".to_string(),
    ];
    if !configuration.data_ciphers.is_empty() {
        let ciphers: Vec<&str> = configuration.data_ciphers.iter().map(|c| c.name()).collect();
        lines.push(format!("IV_CIPHERS={}", ciphers.join(":")));
    }
    lines.push("IV_LZO_STUB=1".to_string());
    lines.push("IV_COMP_STUB=1".to_string());
    lines.push("IV_COMP_STUBv2=1".to_string());
    lines.push(format!("IV_PLAT={}", platform()));
    if let Some(version) = ssl_version {
        lines.push(format!("IV_SSL={version}"));
    }
    lines.extend(configuration.peer_info.iter().cloned());

    let mut info = lines.join("\n");
    info.push('\n');
    info
}

/// Options string sent in the auth request
pub fn local_options(configuration: &Configuration) -> String {
    let mut options = vec!["V4".to_string(), "dev-type tun".to_string()];
    match configuration.compression_framing {
        CompressionFraming::CompLzo => options.push("comp-lzo".to_string()),
        CompressionFraming::Compress => options.push("compress".to_string()),
        CompressionFraming::Disabled | CompressionFraming::CompressV2 => {}
    }
    if let Some(wrap) = &configuration.tls_wrap {
        if let Some(direction) = wrap.direction {
            let value = match direction {
                StaticKeyDirection::Server => 0,
                StaticKeyDirection::Client => 1,
            };
            options.push(format!("keydir {value}"));
        }
    }
    let cipher = configuration.fallback_cipher();
    options.push(format!("cipher {}", cipher.name()));
    options.push(format!("auth {}", configuration.fallback_digest().name()));
    options.push(format!("keysize {}", cipher.key_length() * 8));
    if let Some(wrap) = &configuration.tls_wrap {
        options.push(match wrap.strategy {
            TlsWrapStrategy::Auth => "tls-auth".to_string(),
            TlsWrapStrategy::Crypt => "tls-crypt".to_string(),
        });
    }
    options.push("key-method 2".to_string());
    options.push("tls-client".to_string());
    options.join(",")
}

/// Client side of the key-method 2 exchange for one negotiation
pub struct Authenticator {
    control_buffer: ZeroingData,
    pre_master: ZeroingData,
    random1: ZeroingData,
    random2: ZeroingData,
    server_random1: Option<ZeroingData>,
    server_random2: Option<ZeroingData>,
    username: Option<ZeroingData>,
    password: Option<ZeroingData>,
    pub with_local_options: bool,
    pub ssl_version: Option<String>,
}

impl Authenticator {
    /// Credentials are only sent when both are present
    pub fn new(prng: &dyn Prng, username: Option<&str>, password: Option<&str>) -> Self {
        let (username, password) = match (username, password) {
            (Some(username), Some(password)) => {
                (Some(null_terminated(username)), Some(null_terminated(password)))
            }
            _ => (None, None),
        };
        Self {
            control_buffer: Zeroizing::new(Vec::new()),
            pre_master: prng.safe_data(MASTER_SECRET_LENGTH),
            random1: prng.safe_data(RANDOM_LENGTH),
            random2: prng.safe_data(RANDOM_LENGTH),
            server_random1: None,
            server_random2: None,
            username,
            password,
            with_local_options: true,
            ssl_version: None,
        }
    }

    /// The plaintext auth request
    pub fn request(&self, configuration: &Configuration) -> ZeroingData {
        let mut raw = Zeroizing::new(Vec::with_capacity(512));
        raw.extend_from_slice(&TLS_PREFIX);
        raw.extend_from_slice(&self.pre_master);
        raw.extend_from_slice(&self.random1);
        raw.extend_from_slice(&self.random2);

        let options = if self.with_local_options {
            local_options(configuration)
        } else {
            "V0 UNDEF".to_string()
        };
        info!("Auth: local options {options}");
        append_sized(&mut raw, &null_terminated(&options));

        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                append_sized(&mut raw, username);
                append_sized(&mut raw, password);
            }
            _ => {
                raw.extend_from_slice(&0u16.to_be_bytes());
                raw.extend_from_slice(&0u16.to_be_bytes());
            }
        }

        let info = peer_info(configuration, self.ssl_version.as_deref());
        append_sized(&mut raw, &null_terminated(&info));
        raw
    }

    /// Write the auth request into the TLS stream
    pub fn put_auth(&self, tls: &mut dyn TlsCapability, configuration: &Configuration) -> Result<()> {
        tls.put_plain_text(&self.request(configuration))
    }

    /// Buffer plaintext pulled from TLS
    pub fn append_control_data(&mut self, data: &[u8]) {
        self.control_buffer.extend_from_slice(data);
    }

    /// Parse the server auth reply, `false` until enough data is buffered
    pub fn parse_auth_reply(&mut self) -> Result<bool> {
        let buffer = &self.control_buffer;
        let mut offset = TLS_PREFIX.len();
        if buffer.len() < offset + 2 * RANDOM_LENGTH + SIZE_LENGTH {
            return Ok(false);
        }
        if buffer[..offset] != TLS_PREFIX {
            return Err(VpnError::WrongControlDataPrefix);
        }

        let server_random1 = zeroing(&buffer[offset..offset + RANDOM_LENGTH]);
        offset += RANDOM_LENGTH;
        let server_random2 = zeroing(&buffer[offset..offset + RANDOM_LENGTH]);
        offset += RANDOM_LENGTH;

        let options_length = u16::from_be_bytes([buffer[offset], buffer[offset + 1]]) as usize;
        offset += SIZE_LENGTH;
        if buffer.len() < offset + options_length {
            return Ok(false);
        }
        let options = &buffer[offset..offset + options_length];
        let options = options.split(|b| *b == 0).next().unwrap_or_default();
        info!("Auth: server options \"{}\"", String::from_utf8_lossy(options));
        offset += options_length;

        self.server_random1 = Some(server_random1);
        self.server_random2 = Some(server_random2);
        self.control_buffer.drain(..offset);
        Ok(true)
    }

    /// Drain complete NUL-terminated messages from the buffer
    pub fn parse_messages(&mut self) -> Vec<String> {
        let mut messages = Vec::new();
        let mut offset = 0;
        while let Some(end) = self.control_buffer[offset..].iter().position(|b| *b == 0) {
            let message = &self.control_buffer[offset..offset + end];
            messages.push(String::from_utf8_lossy(message).into_owned());
            offset += end + 1;
        }
        self.control_buffer.drain(..offset);
        debug!("Auth: parsed {} control messages", messages.len());
        messages
    }

    /// Key exchange material, once the server reply was parsed
    pub fn key_exchange<'a>(
        &'a self,
        session_id: &'a [u8],
        remote_session_id: &'a [u8],
    ) -> Option<KeyExchange<'a>> {
        Some(KeyExchange {
            pre_master: &self.pre_master,
            random1: &self.random1,
            random2: &self.random2,
            server_random1: self.server_random1.as_deref()?,
            server_random2: self.server_random2.as_deref()?,
            session_id,
            remote_session_id,
        })
    }
}
