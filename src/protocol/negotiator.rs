//! Per-key negotiation state machine
//!
//! A [`Negotiator`] drives one session key from the initial reset through
//! the TLS handshake, key-method 2 authentication and PUSH_REPLY to a
//! connected data channel. It never performs I/O: every entry point takes
//! the current time and the session's [`ControlChannel`] and returns the
//! [`NegotiatorAction`]s for the caller to carry out.

use super::auth::Authenticator;
use super::constants::PUSH_REQUEST;
use super::control::ControlChannel;
use super::data::{DataChannel, DataPath};
use super::hard_reset::PiaHardReset;
use super::packets::ControlPacket;
use super::push_reply::{self, PushReply};
use super::{next_key, PacketCode};
use crate::config::{CompressionAlgorithm, Configuration};
use crate::crypto::kdf::derive_keys;
use crate::crypto::tls::{TlsCapability, TlsFactory, TlsOptions};
use crate::crypto::{CipherAlgorithm, CryptoBoxFactory, CryptoOptions, Prng};
use crate::error::{Result, VpnError};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

/// Negotiation progress, strictly ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Idle,
    Tls,
    Auth,
    Push,
    Connected,
}

/// Side that asked for a new key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renegotiation {
    Client,
    Server,
}

/// What a renegotiation inherits from the previous key
#[derive(Debug, Clone)]
pub struct NegotiationHistory {
    pub push_reply: PushReply,
}

/// Settings shared by all negotiators of a session
#[derive(Clone)]
pub struct NegotiatorOptions {
    pub configuration: Arc<Configuration>,
    pub tls_options: TlsOptions,
    pub with_local_options: bool,
    /// Whether the link retransmits by itself (TCP)
    pub link_is_reliable: bool,
    pub prng: Arc<dyn Prng>,
    pub tls_factory: TlsFactory,
    pub crypto_factory: CryptoBoxFactory,
}

/// A key ready for data traffic
pub struct Negotiated {
    pub key: u8,
    pub data_channel: DataChannel,
    pub push_reply: PushReply,
}

impl fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiated")
            .field("key", &self.key)
            .field("data_channel", &self.data_channel)
            .finish_non_exhaustive()
    }
}

/// Work for the caller
#[derive(Debug)]
pub enum NegotiatorAction {
    /// Write raw packets to the link
    Send(Vec<Bytes>),
    /// The key is negotiated
    Connected(Box<Negotiated>),
}

pub struct Negotiator {
    key: u8,
    history: Option<NegotiationHistory>,
    renegotiation: Option<Renegotiation>,
    options: Arc<NegotiatorOptions>,
    start_time: Instant,
    negotiation_timeout: Duration,
    state: NegotiationState,
    tls: Box<dyn TlsCapability>,
    expected_packet_id: u32,
    pending_packets: BTreeMap<u32, ControlPacket>,
    authenticator: Option<Authenticator>,
    next_push_request: Option<Instant>,
    continuation: Option<String>,
}

impl Negotiator {
    /// Negotiator for key 0 of a new session
    pub fn new(options: Arc<NegotiatorOptions>, now: Instant) -> Self {
        Self::with_key(0, None, None, options, now)
    }

    fn with_key(
        key: u8,
        history: Option<NegotiationHistory>,
        renegotiation: Option<Renegotiation>,
        options: Arc<NegotiatorOptions>,
        now: Instant,
    ) -> Self {
        let timings = &options.configuration.options;
        let negotiation_timeout = if renegotiation.is_some() {
            timings.soft_negotiation_timeout()
        } else {
            timings.negotiation_timeout()
        };
        let tls = (options.tls_factory)();
        Self {
            key,
            history,
            renegotiation,
            options,
            start_time: now,
            negotiation_timeout,
            state: NegotiationState::Idle,
            tls,
            expected_packet_id: 0,
            pending_packets: BTreeMap::new(),
            authenticator: None,
            next_push_request: None,
            continuation: None,
        }
    }

    /// Negotiator for the next key, `None` before the first negotiation
    /// completed
    pub fn for_renegotiation(&self, renegotiation: Renegotiation, now: Instant) -> Option<Self> {
        let Some(history) = &self.history else {
            error!("Negotiator {} has no history (not connected yet?)", self.key);
            return None;
        };
        Some(Self::with_key(
            next_key(self.key),
            Some(history.clone()),
            Some(renegotiation),
            Arc::clone(&self.options),
            now,
        ))
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn history(&self) -> Option<&NegotiationHistory> {
        self.history.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == NegotiationState::Connected
    }

    pub fn is_renegotiating(&self) -> bool {
        self.renegotiation.is_some() && self.state != NegotiationState::Connected
    }

    fn set_state(&mut self, state: NegotiationState) {
        info!("Negotiator: {} -> {state:?}", self.key);
        self.state = state;
    }

    /// Reset the control channel and send the initial packet
    pub fn start(&mut self, channel: &mut ControlChannel, now: Instant) -> Result<Vec<NegotiatorAction>> {
        channel.reset(self.renegotiation.is_none());

        let mut actions = self.check_negotiation(channel, now)?;
        match self.renegotiation {
            Some(Renegotiation::Client) => {
                self.enqueue(channel, PacketCode::SoftResetV1, &[], now, &mut actions)?;
            }
            Some(Renegotiation::Server) => {}
            None => {
                let payload = self.hard_reset_payload().unwrap_or_default();
                self.enqueue(channel, PacketCode::HardResetClientV2, &payload, now, &mut actions)?;
            }
        }
        Ok(actions)
    }

    /// Periodic negotiation check, the caller repeats it every tick until
    /// the key is connected
    pub fn tick(&mut self, channel: &mut ControlChannel, now: Instant) -> Result<Vec<NegotiatorAction>> {
        self.check_negotiation(channel, now)
    }

    fn check_negotiation(&mut self, channel: &mut ControlChannel, now: Instant) -> Result<Vec<NegotiatorAction>> {
        let elapsed = now.saturating_duration_since(self.start_time);
        let options = Arc::clone(&self.options);
        let timings = &options.configuration.options;
        if self.state == NegotiationState::Idle && elapsed > timings.hard_reset_timeout() {
            return Err(VpnError::recoverable(VpnError::NegotiationTimeout));
        }
        if self.state != NegotiationState::Connected && elapsed > self.negotiation_timeout {
            return Err(VpnError::NegotiationTimeout);
        }

        let mut actions = Vec::new();
        if !self.is_renegotiating() {
            self.push_request(channel, now, &mut actions)?;
        }
        if !self.options.link_is_reliable {
            let packets = channel.write_outbound_packets(now, timings.retx_interval())?;
            if !packets.is_empty() {
                actions.push(NegotiatorAction::Send(packets));
            }
        }
        Ok(actions)
    }

    fn push_request(
        &mut self,
        channel: &mut ControlChannel,
        now: Instant,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        if self.state != NegotiationState::Push {
            return Ok(());
        }
        match self.next_push_request {
            Some(next) if now > next => {}
            _ => return Ok(()),
        }

        info!("TLS.ifconfig: Put plaintext (PUSH_REQUEST)");
        if let Err(err) = self.tls.put_plain_text(PUSH_REQUEST) {
            warn!("TLS.ifconfig: Failed to put PUSH_REQUEST: {err}");
        }
        let Some(cipher_text) = self.tls.pull_cipher_text()? else {
            debug!("TLS.ifconfig: Still can't pull ciphertext");
            return Ok(());
        };
        self.enqueue(channel, PacketCode::ControlV1, &cipher_text, now, actions)?;
        self.next_push_request = Some(now + self.options.configuration.options.push_request_interval());
        Ok(())
    }

    fn hard_reset_payload(&self) -> Option<Vec<u8>> {
        let configuration = &self.options.configuration;
        if !configuration.uses_pia_patches {
            return None;
        }
        let ca_path = configuration.ca_path.as_deref()?;
        match self.tls.md5(ca_path) {
            Ok(md5) => {
                info!("PIA CA MD5 is: {md5}");
                let reset = PiaHardReset::new(
                    md5,
                    configuration.fallback_cipher(),
                    configuration.fallback_digest(),
                );
                Some(reset.encode(self.options.prng.as_ref()))
            }
            Err(err) => {
                error!("PIA CA MD5 could not be computed, skip custom HARD_RESET: {err}");
                None
            }
        }
    }

    fn enqueue(
        &self,
        channel: &mut ControlChannel,
        code: PacketCode,
        payload: &[u8],
        now: Instant,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        let max_packet_size = self.options.configuration.options.max_packet_size;
        let packets = channel.enqueue_outbound_packets(code, self.key, payload, max_packet_size, now)?;
        if !packets.is_empty() {
            actions.push(NegotiatorAction::Send(packets));
        }
        Ok(())
    }

    /// Process a packet released in order by the control channel
    ///
    /// Packets ahead of the expected id are parked until the gap closes,
    /// older ones are ignored.
    pub fn handle_control_packet(
        &mut self,
        channel: &mut ControlChannel,
        packet: ControlPacket,
        now: Instant,
    ) -> Result<Vec<NegotiatorAction>> {
        let mut actions = Vec::new();
        if packet.packet_id < self.expected_packet_id {
            return Ok(actions);
        }
        if packet.packet_id > self.expected_packet_id {
            self.pending_packets.insert(packet.packet_id, packet);
            return Ok(actions);
        }

        self.process_packet(channel, packet, now, &mut actions)?;
        self.expected_packet_id += 1;
        while let Some(packet) = self.pending_packets.remove(&self.expected_packet_id) {
            self.process_packet(channel, packet, now, &mut actions)?;
            self.expected_packet_id += 1;
        }
        Ok(actions)
    }

    fn check_remote_session(channel: &ControlChannel, packet: &ControlPacket) -> Result<()> {
        let Some(remote_session_id) = channel.remote_session_id() else {
            error!("No remote session id (control packets before server HARD_RESET)");
            return Err(VpnError::MissingSessionId);
        };
        if packet.session_id != remote_session_id {
            error!(
                "Packet session mismatch ({} != {})",
                hex::encode(packet.session_id),
                hex::encode(remote_session_id)
            );
            return Err(VpnError::SessionMismatch);
        }
        Ok(())
    }

    fn process_packet(
        &mut self,
        channel: &mut ControlChannel,
        packet: ControlPacket,
        now: Instant,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        if packet.key != self.key {
            error!("Bad key in control packet ({} != {})", packet.key, self.key);
            return Ok(());
        }

        if self.state == NegotiationState::Idle {
            if !matches!(packet.code, PacketCode::HardResetServerV2 | PacketCode::SoftResetV1) {
                return Ok(());
            }
            if packet.code == PacketCode::HardResetServerV2 {
                if self.is_renegotiating() {
                    error!("Sent SOFT_RESET but received HARD_RESET?");
                }
                channel.set_remote_session_id(packet.session_id);
            }
            Self::check_remote_session(channel, &packet)?;

            info!("Start TLS handshake");
            self.set_state(NegotiationState::Tls);
            self.tls.configure(&self.options.tls_options)?;
            self.tls.start()?;
            let cipher_text = self.tls.pull_cipher_text()?.ok_or_else(|| {
                VpnError::Tls("No ClientHello after starting the handshake".to_string())
            })?;
            debug!("TLS.connect: Pulled ciphertext ({} bytes)", cipher_text.len());
            return self.enqueue(channel, PacketCode::ControlV1, &cipher_text, now, actions);
        }

        if packet.code != PacketCode::ControlV1 {
            return Ok(());
        }
        Self::check_remote_session(channel, &packet)?;
        let Some(cipher_text_in) = &packet.payload else {
            error!("TLS.connect: Control packet with empty payload?");
            return Ok(());
        };

        trace!(
            "TLS.connect: Put received ciphertext [{}] {}",
            packet.packet_id,
            hex::encode(cipher_text_in)
        );
        if let Err(err) = self.tls.put_cipher_text(cipher_text_in) {
            warn!("TLS.connect: Failed to put ciphertext: {err}");
        }
        match self.tls.pull_cipher_text()? {
            Some(cipher_text) => {
                debug!("TLS.connect: Send pulled ciphertext ({} bytes)", cipher_text.len());
                self.enqueue(channel, PacketCode::ControlV1, &cipher_text, now, actions)?;
            }
            None => debug!("TLS.connect: No available ciphertext to pull"),
        }

        if self.state < NegotiationState::Auth && self.tls.is_connected() {
            info!("TLS.connect: Handshake is complete");
            self.set_state(NegotiationState::Auth);
            self.on_tls_connect(channel, now, actions)?;
        }

        while let Some(data) = self.tls.pull_plain_text()? {
            self.handle_control_data(channel, &data, now, actions)?;
        }
        Ok(())
    }

    fn on_tls_connect(
        &mut self,
        channel: &mut ControlChannel,
        now: Instant,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        let configuration = Arc::clone(&self.options.configuration);
        let credentials = configuration.credentials.as_ref();
        let password = match (
            self.history.as_ref().and_then(|h| h.push_reply.options.auth_token.as_deref()),
            credentials,
        ) {
            (Some(token), _) => Some(Zeroizing::new(token.to_string())),
            (None, Some(credentials)) => Some(Zeroizing::new(format!(
                "{}{}",
                credentials.password,
                credentials.otp.as_deref().unwrap_or_default()
            ))),
            (None, None) => None,
        };

        let mut authenticator = Authenticator::new(
            self.options.prng.as_ref(),
            credentials.map(|c| c.username.as_str()),
            password.as_deref().map(String::as_str),
        );
        authenticator.with_local_options = self.options.with_local_options;
        authenticator.put_auth(self.tls.as_mut(), &configuration)?;
        self.authenticator = Some(authenticator);

        let Some(cipher_text) = self.tls.pull_cipher_text()? else {
            debug!("TLS.auth: Still can't pull ciphertext");
            return Ok(());
        };
        debug!("TLS.auth: Pulled ciphertext ({} bytes)", cipher_text.len());
        self.enqueue(channel, PacketCode::ControlV1, &cipher_text, now, actions)
    }

    fn handle_control_data(
        &mut self,
        channel: &mut ControlChannel,
        data: &[u8],
        now: Instant,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        let Some(authenticator) = self.authenticator.as_mut() else {
            return Ok(());
        };
        debug!("Pulled plain control data ({} bytes)", data.len());
        authenticator.append_control_data(data);

        if self.state == NegotiationState::Auth {
            if !authenticator.parse_auth_reply()? {
                return Ok(());
            }

            if self.is_renegotiating() {
                self.set_state(NegotiationState::Connected);
                let Some(history) = &self.history else {
                    error!("Renegotiating connection without former history");
                    return Err(VpnError::Assertion("renegotiation without history".to_string()));
                };
                let push_reply = history.push_reply.clone();
                return self.complete_connection(channel, push_reply, actions);
            }

            self.set_state(NegotiationState::Push);
            self.next_push_request = Some(now + self.options.configuration.options.retx_interval());
        }

        let messages = self
            .authenticator
            .as_mut()
            .map(Authenticator::parse_messages)
            .unwrap_or_default();
        for message in messages {
            self.handle_control_message(channel, &message, actions)?;
        }
        Ok(())
    }

    fn handle_control_message(
        &mut self,
        channel: &mut ControlChannel,
        message: &str,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        debug!("Received control message ({} bytes)", message.len());

        if message.starts_with("AUTH_FAILED") {
            if self.authenticator.as_ref().is_some_and(|a| a.with_local_options) {
                error!("Authentication failure, retry without local options");
                return Err(VpnError::BadCredentialsWithLocalOptions);
            }
            return Err(VpnError::BadCredentials);
        }
        if message.starts_with("RESTART") {
            info!("Disconnect due to server shutdown");
            return Err(VpnError::ServerShutdown);
        }
        if self.state != NegotiationState::Push {
            return Ok(());
        }

        let complete = match self.continuation.take() {
            Some(previous) => push_reply::join_fragments(&previous, message),
            None => message.to_string(),
        };
        let reply = match PushReply::parse(&complete) {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(()),
            Err(VpnError::ContinuationPushReply) => {
                debug!("PUSH_REPLY continues in the next message");
                self.continuation = Some(push_reply::strip_continuation(&complete));
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        info!("Received PUSH_REPLY: \"{reply}\"");

        if let Some(algorithm) = reply.options.compression_algorithm {
            if algorithm != CompressionAlgorithm::Disabled {
                error!(
                    "Server has {algorithm:?} compression enabled (framing={:?}), unsupported",
                    reply.options.compression_framing
                );
                return Err(VpnError::ServerCompression);
            }
        }
        if reply.options.ipv4.is_none() && reply.options.ipv6.is_none() {
            return Err(VpnError::NoRouting);
        }
        if self.state == NegotiationState::Connected {
            error!("Ignore multiple calls to complete connection");
            return Ok(());
        }
        self.set_state(NegotiationState::Connected);
        self.complete_connection(channel, reply, actions)
    }

    fn complete_connection(
        &mut self,
        channel: &ControlChannel,
        push_reply: PushReply,
        actions: &mut Vec<NegotiatorAction>,
    ) -> Result<()> {
        info!("Complete connection of key {}", self.key);
        let history = NegotiationHistory { push_reply };
        let data_channel = self.new_data_channel(channel, &history)?;
        self.authenticator = None;
        let push_reply = history.push_reply.clone();
        self.history = Some(history);
        actions.push(NegotiatorAction::Connected(Box::new(Negotiated {
            key: self.key,
            data_channel,
            push_reply,
        })));
        Ok(())
    }

    fn new_data_channel(&self, channel: &ControlChannel, history: &NegotiationHistory) -> Result<DataChannel> {
        let session_id = channel.session_id();
        let remote_session_id = channel.remote_session_id().ok_or_else(|| {
            VpnError::Assertion("setting up connection without a remote session id".to_string())
        })?;
        let authenticator = self.authenticator.as_ref().ok_or_else(|| {
            VpnError::Assertion("setting up connection without authenticator".to_string())
        })?;
        let exchange = authenticator
            .key_exchange(&session_id, &remote_session_id)
            .ok_or_else(|| VpnError::Assertion("setting up connection without auth response".to_string()))?;
        let keys = derive_keys(&exchange)?;

        info!("Set up encryption");
        let configuration = &self.options.configuration;
        let pushed = &history.push_reply.options;
        let cipher = pushed.cipher.unwrap_or_else(|| configuration.fallback_cipher());
        let mut crypto = (self.options.crypto_factory)();
        crypto.configure(CryptoOptions {
            cipher: Some(CipherAlgorithm::Data(cipher)),
            digest: Some(configuration.fallback_digest()),
            cipher_enc_key: Some(keys.cipher_enc_key),
            cipher_dec_key: Some(keys.cipher_dec_key),
            hmac_enc_key: Some(keys.hmac_enc_key),
            hmac_dec_key: Some(keys.hmac_dec_key),
        })?;

        let path = DataPath::new(
            crypto,
            pushed.peer_id,
            pushed
                .compression_framing
                .unwrap_or_else(|| configuration.fallback_compression_framing()),
            pushed
                .compression_algorithm
                .unwrap_or(configuration.compression_algorithm),
            configuration.options.uses_replay_protection,
        );
        Ok(DataChannel::new(self.key, path))
    }

    /// Client-side rekey is due
    pub fn should_renegotiate(&self, now: Instant) -> bool {
        if self.state != NegotiationState::Connected {
            return false;
        }
        match self.options.configuration.renegotiates_after {
            Some(seconds) if seconds > 0 => {
                now.saturating_duration_since(self.start_time) >= Duration::from_secs(seconds)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("renegotiation", &self.renegotiation)
            .finish_non_exhaustive()
    }
}
