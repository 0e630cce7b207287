//! Session orchestration
//!
//! [`SessionCore`] owns the control channel, the negotiator of every live
//! key and their data channels. Like the negotiator it performs no I/O:
//! inbound link and tunnel batches, timer expirations and shutdown requests
//! go in, [`SessionAction`]s come out. [`runner::Session`] confines a core
//! to a single tokio task and carries the actions out.

use crate::config::{Configuration, SocketType};
use crate::crypto::tls::{TlsFactory, TlsOptions};
use crate::crypto::{CryptoBoxFactory, Prng};
use crate::error::{Result, VpnError};
use crate::protocol::constants::{PEER_ID_LENGTH, PING_STRING};
use crate::protocol::control::ControlChannel;
use crate::protocol::data::DataChannel;
use crate::protocol::negotiator::{Negotiated, Negotiator, NegotiatorAction, NegotiatorOptions, Renegotiation};
use crate::protocol::push_reply::PushReply;
use crate::protocol::serializer::ControlSerializer;
use crate::protocol::{occ_exit_payload, parse_opcode, PacketCode};
use crate::tunnel::Link;
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tokio-runtime")]
pub mod runner;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Cumulative tunnel bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataCount {
    pub inbound: u64,
    pub outbound: u64,
}

/// What the session needs to know about its link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub remote_address: String,
    pub remote_protocol: SocketType,
    pub is_reliable: bool,
}

impl LinkInfo {
    pub fn of(link: &dyn Link) -> Self {
        Self {
            remote_address: link.remote_address(),
            remote_protocol: link.remote_protocol(),
            is_reliable: link.is_reliable(),
        }
    }
}

/// Pluggable providers used by every negotiation
#[derive(Clone)]
pub struct Capabilities {
    pub prng: Arc<dyn Prng>,
    pub tls_factory: TlsFactory,
    pub crypto_factory: CryptoBoxFactory,
}

impl Default for Capabilities {
    /// System randomness, rustls and the bundled crypto box
    fn default() -> Self {
        Self {
            prng: Arc::new(crate::crypto::SystemPrng),
            tls_factory: crate::crypto::tls::rustls_factory(),
            crypto_factory: crate::crypto::standard_crypto_factory(),
        }
    }
}

/// Work for the session driver
#[derive(Debug)]
pub enum SessionAction {
    SendToLink(Vec<Bytes>),
    SendToTunnel(Vec<Bytes>),
    /// Call [`SessionCore::negotiation_tick`] for `key` after the delay
    ScheduleNegotiationTick { key: u8, after: Duration },
    /// Call [`SessionCore::ping_tick`] after the delay, replacing any
    /// pending ping
    SchedulePing { after: Duration },
    /// First key negotiated
    Started {
        remote_address: String,
        remote_protocol: SocketType,
        push_reply: Box<PushReply>,
    },
    DataCount(DataCount),
}

/// Outcome of a completed shutdown
#[derive(Debug)]
pub struct StopReport {
    pub error: Option<VpnError>,
    pub should_reconnect: bool,
}

pub struct SessionCore {
    configuration: Arc<Configuration>,
    tls_options: TlsOptions,
    capabilities: Capabilities,
    state: SessionState,
    with_local_options: bool,
    link: Option<LinkInfo>,
    control_channel: Option<ControlChannel>,
    negotiators: BTreeMap<u8, Negotiator>,
    current_key: Option<u8>,
    data_channels: BTreeMap<u8, DataChannel>,
    current_data_key: Option<u8>,
    old_keys: VecDeque<u8>,
    push_reply: Option<PushReply>,
    last_received: Option<Instant>,
    data_count: DataCount,
    last_data_count_report: Option<Instant>,
}

impl SessionCore {
    pub fn new(configuration: Arc<Configuration>, tls_options: TlsOptions, capabilities: Capabilities) -> Self {
        Self {
            configuration,
            tls_options,
            capabilities,
            state: SessionState::Stopped,
            with_local_options: true,
            link: None,
            control_channel: None,
            negotiators: BTreeMap::new(),
            current_key: None,
            data_channels: BTreeMap::new(),
            current_data_key: None,
            old_keys: VecDeque::new(),
            push_reply: None,
            last_received: None,
            data_count: DataCount::default(),
            last_data_count_report: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn link(&self) -> Option<&LinkInfo> {
        self.link.as_ref()
    }

    /// Options pushed by the server for the current connection
    pub fn push_reply(&self) -> Option<&PushReply> {
        self.push_reply.as_ref()
    }

    pub fn data_count(&self) -> DataCount {
        self.data_count
    }

    /// Key of the data channel used for outbound traffic
    pub fn current_data_key(&self) -> Option<u8> {
        self.current_data_key
    }

    /// Keys that still decrypt inbound traffic
    pub fn data_channel_keys(&self) -> Vec<u8> {
        self.data_channels.keys().copied().collect()
    }

    fn is_stopping(&self) -> bool {
        matches!(self.state, SessionState::Stopping | SessionState::Stopped)
    }

    fn current_negotiator(&self) -> Option<&Negotiator> {
        self.current_key.and_then(|key| self.negotiators.get(&key))
    }

    fn new_control_channel(&self) -> Result<ControlChannel> {
        let serializer = match &self.configuration.tls_wrap {
            Some(wrap) => ControlSerializer::wrapped(
                wrap.strategy,
                &wrap.load_key()?,
                self.configuration.fallback_digest(),
                &self.capabilities.crypto_factory,
            )?,
            None => ControlSerializer::Plain,
        };
        Ok(ControlChannel::new(serializer, Arc::clone(&self.capabilities.prng)))
    }

    /// Attach a link and start negotiating key 0
    pub fn set_link(&mut self, link: LinkInfo, now: Instant) -> Result<Vec<SessionAction>> {
        if self.link.is_some() {
            warn!("Link interface already set!");
            return Ok(Vec::new());
        }
        info!("Starting VPN session over {} ({})", link.remote_address, link.remote_protocol);

        let options = Arc::new(NegotiatorOptions {
            configuration: Arc::clone(&self.configuration),
            tls_options: self.tls_options.clone(),
            with_local_options: self.with_local_options,
            link_is_reliable: link.is_reliable,
            prng: Arc::clone(&self.capabilities.prng),
            tls_factory: Arc::clone(&self.capabilities.tls_factory),
            crypto_factory: Arc::clone(&self.capabilities.crypto_factory),
        });
        self.link = Some(link);
        self.state = SessionState::Starting;
        self.control_channel = Some(self.new_control_channel()?);

        let negotiator = Negotiator::new(options, now);
        self.start_negotiator(negotiator, now)
    }

    fn start_negotiator(&mut self, mut negotiator: Negotiator, now: Instant) -> Result<Vec<SessionAction>> {
        let key = negotiator.key();
        let channel = self.control_channel.as_mut().ok_or_else(no_control_channel)?;
        let produced = negotiator.start(channel, now)?;
        self.negotiators.insert(key, negotiator);
        self.current_key = Some(key);

        let mut actions = Vec::new();
        self.apply(produced, now, &mut actions)?;
        actions.push(SessionAction::ScheduleNegotiationTick {
            key,
            after: self.configuration.options.tick_interval(),
        });
        Ok(actions)
    }

    fn start_renegotiation(
        &mut self,
        renegotiation: Renegotiation,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<()> {
        let Some(current) = self.current_negotiator() else {
            return Ok(());
        };
        if current.is_renegotiating() {
            error!("Renegotiation already in progress");
            return Ok(());
        }
        match renegotiation {
            Renegotiation::Client => info!("Renegotiating (client-initiated)"),
            Renegotiation::Server => info!("Renegotiating (server-initiated)"),
        }
        let Some(negotiator) = current.for_renegotiation(renegotiation, now) else {
            return Ok(());
        };
        actions.extend(self.start_negotiator(negotiator, now)?);
        Ok(())
    }

    fn apply(
        &mut self,
        produced: Vec<NegotiatorAction>,
        now: Instant,
        actions: &mut Vec<SessionAction>,
    ) -> Result<()> {
        for action in produced {
            match action {
                NegotiatorAction::Send(packets) => actions.push(SessionAction::SendToLink(packets)),
                NegotiatorAction::Connected(negotiated) => self.did_negotiate(*negotiated, now, actions),
            }
        }
        Ok(())
    }

    fn did_negotiate(&mut self, negotiated: Negotiated, now: Instant, actions: &mut Vec<SessionAction>) {
        let Negotiated {
            key,
            data_channel,
            push_reply,
        } = negotiated;
        info!("Did negotiate key {key}");

        self.data_channels.insert(key, data_channel);
        if let Some(previous) = self.current_data_key.replace(key) {
            self.old_keys.push_back(previous);
        }
        while self.old_keys.len() > 1 {
            if let Some(stale) = self.old_keys.pop_front() {
                debug!("Dropping stale key {stale}");
                self.negotiators.remove(&stale);
                self.data_channels.remove(&stale);
            }
        }

        if self.state == SessionState::Starting {
            self.state = SessionState::Started;
            if let Some(link) = &self.link {
                info!("Session did start");
                actions.push(SessionAction::Started {
                    remote_address: link.remote_address.clone(),
                    remote_protocol: link.remote_protocol,
                    push_reply: Box::new(push_reply.clone()),
                });
            }
            self.last_data_count_report = Some(now);
        }
        self.push_reply = Some(push_reply);
        actions.push(SessionAction::SchedulePing {
            after: self.ping_interval(),
        });
    }

    /// Periodic negotiation check for `key`, rescheduled until connected
    pub fn negotiation_tick(&mut self, key: u8, now: Instant) -> Result<Vec<SessionAction>> {
        let mut actions = Vec::new();
        if self.is_stopping() {
            return Ok(actions);
        }
        let (Some(negotiator), Some(channel)) = (self.negotiators.get_mut(&key), self.control_channel.as_mut()) else {
            return Ok(actions);
        };
        if negotiator.is_connected() {
            return Ok(actions);
        }
        let produced = negotiator.tick(channel, now)?;
        let connected = negotiator.is_connected();
        self.apply(produced, now, &mut actions)?;
        if !connected {
            actions.push(SessionAction::ScheduleNegotiationTick {
                key,
                after: self.configuration.options.tick_interval(),
            });
        }
        Ok(actions)
    }

    /// Demultiplex a batch read from the link
    ///
    /// Data packets are decrypted per key and forwarded to the tunnel,
    /// control packets are acknowledged and handed to the current
    /// negotiator in order. Malformed packets are dropped.
    pub fn receive_link(&mut self, packets: Vec<Bytes>, now: Instant) -> Result<Vec<SessionAction>> {
        let mut actions = Vec::new();
        if self.is_stopping() || self.link.is_none() {
            return Ok(actions);
        }
        self.last_received = Some(now);

        if self.current_negotiator().is_some_and(|n| n.should_renegotiate(now)) {
            self.start_renegotiation(Renegotiation::Client, now, &mut actions)?;
        }

        let mut data_batches: BTreeMap<u8, Vec<Bytes>> = BTreeMap::new();
        for packet in packets {
            let Some(&first) = packet.first() else {
                warn!("Dropped malformed packet (missing opcode)");
                continue;
            };
            let (code, key) = match parse_opcode(first) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("Dropped malformed packet: {err}");
                    continue;
                }
            };

            if code.is_data() {
                if code == PacketCode::DataV2 && packet.len() < 1 + PEER_ID_LENGTH {
                    warn!("Dropped malformed packet (missing peer id)");
                    continue;
                }
                if !self.data_channels.contains_key(&key) {
                    debug!("Data: no channel for key {key}, dropping packet");
                    continue;
                }
                data_batches.entry(key).or_default().push(packet);
                continue;
            }

            self.receive_control(&packet, now, &mut actions)?;
        }

        for (key, batch) in data_batches {
            let Some(data_channel) = self.data_channels.get_mut(&key) else {
                continue;
            };
            let decrypted = data_channel.decrypt(&batch);
            if decrypted.keep_alive {
                trace!("Data: received ping");
            }
            if decrypted.packets.is_empty() {
                continue;
            }
            self.data_count.inbound += decrypted.packets.iter().map(|p| p.len() as u64).sum::<u64>();
            actions.push(SessionAction::SendToTunnel(decrypted.packets));
        }
        self.report_data_count(now, &mut actions);
        Ok(actions)
    }

    fn receive_control(&mut self, raw: &[u8], now: Instant, actions: &mut Vec<SessionAction>) -> Result<()> {
        let channel = self.control_channel.as_mut().ok_or_else(no_control_channel)?;
        let packet = match channel.read_inbound_packet(raw, 0) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Dropped malformed packet: {err}");
                return Ok(());
            }
        };
        if packet.is_ack() {
            return Ok(());
        }

        match packet.code {
            PacketCode::HardResetServerV2 if self.current_negotiator().is_some_and(Negotiator::is_connected) => {
                error!("Received HARD_RESET_SERVER while connected, the server restarted");
                return Err(VpnError::recoverable(VpnError::StaleSession));
            }
            PacketCode::SoftResetV1 if !self.current_negotiator().is_some_and(Negotiator::is_renegotiating) => {
                self.start_renegotiation(Renegotiation::Server, now, actions)?;
            }
            _ => {}
        }

        let channel = self.control_channel.as_mut().ok_or_else(no_control_channel)?;
        let ack = channel.write_acks(packet.key, vec![packet.packet_id], packet.session_id)?;
        actions.push(SessionAction::SendToLink(vec![ack]));

        for released in channel.enqueue_inbound_packet(packet) {
            let (Some(key), Some(channel)) = (self.current_key, self.control_channel.as_mut()) else {
                break;
            };
            let Some(negotiator) = self.negotiators.get_mut(&key) else {
                break;
            };
            let produced = negotiator.handle_control_packet(channel, released, now)?;
            self.apply(produced, now, actions)?;
        }
        Ok(())
    }

    /// Encrypt a batch read from the tunnel
    ///
    /// Packets are dropped until a key is connected.
    pub fn receive_tunnel(&mut self, packets: Vec<Bytes>, now: Instant) -> Result<Vec<SessionAction>> {
        let mut actions = Vec::new();
        if self.is_stopping() || self.link.is_none() {
            return Ok(actions);
        }
        if !self.current_negotiator().is_some_and(Negotiator::is_connected) {
            return Ok(actions);
        }
        let Some(key) = self.current_data_key else {
            return Ok(actions);
        };
        self.check_ping_timeout(now)?;

        let Some(data_channel) = self.data_channels.get_mut(&key) else {
            return Ok(actions);
        };
        let encrypted = data_channel.encrypt(&packets)?;
        self.data_count.outbound += packets.iter().map(|p| p.len() as u64).sum::<u64>();
        actions.push(SessionAction::SendToLink(encrypted));
        self.report_data_count(now, &mut actions);
        Ok(actions)
    }

    /// Keepalive timer: check the server is alive, send a ping when a
    /// keepalive interval applies, then reschedule
    pub fn ping_tick(&mut self, now: Instant) -> Result<Vec<SessionAction>> {
        let mut actions = Vec::new();
        if self.is_stopping() || self.link.is_none() {
            return Ok(actions);
        }
        let Some(key) = self.current_data_key else {
            return Ok(actions);
        };
        self.check_ping_timeout(now)?;

        if self.keep_alive_interval().is_some() {
            if let Some(data_channel) = self.data_channels.get_mut(&key) {
                debug!("Send ping");
                let ping = data_channel.encrypt(&[Bytes::from_static(&PING_STRING)])?;
                actions.push(SessionAction::SendToLink(ping));
            }
        }
        actions.push(SessionAction::SchedulePing {
            after: self.ping_interval(),
        });
        Ok(actions)
    }

    /// Pushed `ping`, then the configured interval
    fn keep_alive_interval(&self) -> Option<Duration> {
        self.push_reply
            .as_ref()
            .and_then(|reply| reply.options.keep_alive_interval)
            .filter(|interval| !interval.is_zero())
            .or_else(|| {
                self.configuration
                    .keep_alive_interval
                    .filter(|seconds| *seconds > 0)
                    .map(Duration::from_secs)
            })
    }

    /// Pushed `ping-restart`, then the configured timeout, then the default
    ///
    /// A zero timeout is unset.
    fn keep_alive_timeout(&self) -> Duration {
        self.push_reply
            .as_ref()
            .and_then(|reply| reply.options.keep_alive_timeout)
            .filter(|timeout| !timeout.is_zero())
            .or_else(|| {
                self.configuration
                    .keep_alive_timeout
                    .filter(|seconds| *seconds > 0)
                    .map(Duration::from_secs)
            })
            .unwrap_or_else(|| self.configuration.options.ping_timeout())
    }

    fn ping_interval(&self) -> Duration {
        self.keep_alive_interval()
            .unwrap_or_else(|| self.configuration.options.ping_timeout_check_interval())
    }

    fn check_ping_timeout(&self, now: Instant) -> Result<()> {
        let Some(last_received) = self.last_received else {
            return Ok(());
        };
        let timeout = self.keep_alive_timeout();
        if now.saturating_duration_since(last_received) > timeout {
            error!("Server is unreachable ({}s without traffic), stopping session", timeout.as_secs());
            return Err(VpnError::PingTimeout);
        }
        Ok(())
    }

    fn report_data_count(&mut self, now: Instant, actions: &mut Vec<SessionAction>) {
        let due = self.last_data_count_report.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.configuration.options.data_count_interval()
        });
        if due && self.state == SessionState::Started {
            self.last_data_count_report = Some(now);
            actions.push(SessionAction::DataCount(self.data_count));
        }
    }

    /// First half of a shutdown
    ///
    /// Returns `None` when a shutdown is already under way. Otherwise the
    /// session is stopping and the returned packets, possibly none, are the
    /// exit notification to write before closing the link.
    pub fn begin_shutdown(&mut self, error: Option<&VpnError>) -> Option<Vec<Bytes>> {
        if self.is_stopping() {
            return None;
        }
        match error {
            Some(error) => error!("Trigger shutdown (error: {error})"),
            None => info!("Trigger shutdown on request"),
        }
        self.state = SessionState::Stopping;

        let notify = error.map_or(true, VpnError::allows_exit_notify);
        let unreliable = self.link.as_ref().is_some_and(|link| !link.is_reliable);
        if !notify || !unreliable {
            return Some(Vec::new());
        }
        let Some(data_channel) = self.current_data_key.and_then(|key| self.data_channels.get_mut(&key)) else {
            return Some(Vec::new());
        };
        match data_channel.encrypt(&[Bytes::from(occ_exit_payload())]) {
            Ok(packets) => {
                info!("Send OCC exit packet");
                Some(packets)
            }
            Err(err) => {
                warn!("Unable to encrypt OCC exit packet: {err}");
                Some(Vec::new())
            }
        }
    }

    /// Second half of a shutdown: forget every key and the link
    pub fn finish_shutdown(&mut self, error: Option<VpnError>) -> StopReport {
        self.link = None;
        self.control_channel = None;
        self.negotiators.clear();
        self.current_key = None;
        self.data_channels.clear();
        self.current_data_key = None;
        self.old_keys.clear();
        self.push_reply = None;
        self.last_received = None;
        self.data_count = DataCount::default();
        self.last_data_count_report = None;
        self.state = SessionState::Stopped;

        if matches!(error.as_ref().map(VpnError::root), Some(VpnError::BadCredentialsWithLocalOptions)) {
            info!("Next connection will not send local options");
            self.with_local_options = false;
        }
        let should_reconnect = error.as_ref().is_some_and(|error| {
            error.is_recoverable() || matches!(error, VpnError::BadCredentialsWithLocalOptions)
        });
        info!("Session did stop (reconnect: {should_reconnect})");
        StopReport {
            error,
            should_reconnect,
        }
    }
}

fn no_control_channel() -> VpnError {
    VpnError::Assertion("no control channel without a link".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SystemPrng;
    use crate::protocol::constants::PUSH_REQUEST;
    use crate::protocol::negotiator::tests::{
        scripted_factory, server_packet, server_plain, test_configuration, Sent, SERVER_HELLO, SERVER_SID,
    };
    use crate::protocol::packets::ControlPacket;

    const PUSH_REPLY: &str = "PUSH_REPLY,route-gateway 10.8.0.1,topology subnet,ping 10,ping-restart 60,ifconfig 10.8.0.2 255.255.255.0,peer-id 0,cipher AES-256-GCM";

    fn core_with(configuration: Configuration, sent: Sent) -> SessionCore {
        let capabilities = Capabilities {
            prng: Arc::new(SystemPrng),
            tls_factory: scripted_factory(sent),
            crypto_factory: crate::crypto::standard_crypto_factory(),
        };
        SessionCore::new(Arc::new(configuration), TlsOptions::default(), capabilities)
    }

    fn udp_link() -> LinkInfo {
        LinkInfo {
            remote_address: "192.0.2.1".to_string(),
            remote_protocol: SocketType::Udp,
            is_reliable: false,
        }
    }

    fn sent_to_link(actions: &[SessionAction]) -> Vec<ControlPacket> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::SendToLink(packets) => Some(packets),
                _ => None,
            })
            .flatten()
            .filter_map(|raw| ControlPacket::deserialize(raw).ok())
            .collect()
    }

    /// Run the scripted handshake on key 0 up to the start of the session
    fn connect(core: &mut SessionCore, now: Instant) -> Vec<SessionAction> {
        connect_with(core, now, PUSH_REPLY)
    }

    fn connect_with(core: &mut SessionCore, now: Instant, push_reply: &str) -> Vec<SessionAction> {
        let actions = core.set_link(udp_link(), now).unwrap();
        let reset = &sent_to_link(&actions)[0];
        assert_eq!(reset.code, PacketCode::HardResetClientV2);
        let client_sid = reset.session_id;

        let packets = vec![
            server_packet(PacketCode::HardResetServerV2, 0, 0, &[], Some(client_sid)),
            server_packet(PacketCode::ControlV1, 0, 1, SERVER_HELLO, None),
            server_packet(PacketCode::ControlV1, 0, 2, &server_plain(true, &[]), None),
        ];
        core.receive_link(packets, now).unwrap();
        core.negotiation_tick(0, now + Duration::from_secs(1)).unwrap();
        let reply = server_packet(PacketCode::ControlV1, 0, 3, &server_plain(false, &[push_reply]), None);
        core.receive_link(vec![reply], now + Duration::from_secs(1)).unwrap()
    }

    /// Server-initiated rekey to `key`
    fn rekey(core: &mut SessionCore, key: u8, now: Instant) -> Vec<SessionAction> {
        let packets = vec![
            server_packet(PacketCode::SoftResetV1, key, 0, &[], None),
            server_packet(PacketCode::ControlV1, key, 1, SERVER_HELLO, None),
            server_packet(PacketCode::ControlV1, key, 2, &server_plain(true, &[]), None),
        ];
        core.receive_link(packets, now).unwrap()
    }

    #[test]
    fn test_session_starts_after_push_reply() {
        let start = Instant::now();
        let sent = Sent::default();
        let mut core = core_with(test_configuration(), Arc::clone(&sent));
        assert_eq!(core.state(), SessionState::Stopped);

        let actions = connect(&mut core, start);
        assert_eq!(core.state(), SessionState::Started);
        assert!(sent.lock().unwrap().iter().any(|plain| plain == PUSH_REQUEST));

        let started = actions.iter().find_map(|action| match action {
            SessionAction::Started {
                remote_address,
                remote_protocol,
                push_reply,
            } => Some((remote_address, remote_protocol, push_reply)),
            _ => None,
        });
        let (address, protocol, reply) = started.unwrap();
        assert_eq!(address, "192.0.2.1");
        assert_eq!(*protocol, SocketType::Udp);
        assert_eq!(reply.options.keep_alive_interval, Some(Duration::from_secs(10)));
        assert!(actions
            .iter()
            .any(|action| matches!(action, SessionAction::SchedulePing { after } if *after == Duration::from_secs(10))));
        assert_eq!(core.current_data_key(), Some(0));

        // second set_link is ignored
        assert!(core.set_link(udp_link(), start).unwrap().is_empty());
    }

    #[test]
    fn test_control_packets_are_acked() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        let actions = core.set_link(udp_link(), start).unwrap();
        let client_sid = sent_to_link(&actions)[0].session_id;
        assert!(actions
            .iter()
            .any(|action| matches!(action, SessionAction::ScheduleNegotiationTick { key: 0, .. })));

        let reset = server_packet(PacketCode::HardResetServerV2, 0, 0, &[], Some(client_sid));
        let packets = sent_to_link(&core.receive_link(vec![reset], start).unwrap());
        let ack = packets.iter().find(|packet| packet.is_ack()).unwrap();
        assert_eq!(ack.ack_ids, vec![0]);
        assert_eq!(ack.ack_remote_session_id, Some(SERVER_SID));
        assert_eq!(ack.session_id, client_sid);
    }

    #[test]
    fn test_malformed_packets_are_dropped() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);

        let packets = vec![
            Bytes::new(),
            Bytes::from_static(&[0xf8, 1, 2]),
            Bytes::from_static(&[0x48, 0]),
            Bytes::from_static(&[0x4b, 0, 0, 0, 0, 0, 0, 0, 1]),
            Bytes::from_static(&[0x48, 0, 0, 0, 0, 0, 0, 1, 0xde, 0xad]),
            Bytes::from_static(&[0x20, 1]),
        ];
        let actions = core.receive_link(packets, start + Duration::from_secs(2)).unwrap();
        assert!(!actions
            .iter()
            .any(|action| matches!(action, SessionAction::SendToTunnel(_))));
        assert_eq!(core.state(), SessionState::Started);
    }

    #[test]
    fn test_server_rekey_keeps_one_old_key() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);
        assert_eq!(core.data_channel_keys(), vec![0]);

        let actions = rekey(&mut core, 1, start + Duration::from_secs(5));
        assert_eq!(core.current_data_key(), Some(1));
        assert_eq!(core.data_channel_keys(), vec![0, 1]);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, SessionAction::Started { .. })));

        rekey(&mut core, 2, start + Duration::from_secs(10));
        assert_eq!(core.current_data_key(), Some(2));
        assert_eq!(core.data_channel_keys(), vec![1, 2]);
    }

    #[test]
    fn test_client_rekey_after_configured_lifetime() {
        let start = Instant::now();
        let configuration = Configuration {
            renegotiates_after: Some(60),
            ..test_configuration()
        };
        let mut core = core_with(configuration, Sent::default());
        connect(&mut core, start);

        let actions = core.receive_link(Vec::new(), start + Duration::from_secs(30)).unwrap();
        assert!(sent_to_link(&actions).is_empty());

        let actions = core.receive_link(Vec::new(), start + Duration::from_secs(61)).unwrap();
        let packets = sent_to_link(&actions);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].code, PacketCode::SoftResetV1);
        assert_eq!(packets[0].key, 1);

        // a second trigger while renegotiating is ignored
        let actions = core.receive_link(Vec::new(), start + Duration::from_secs(62)).unwrap();
        assert!(sent_to_link(&actions).is_empty());
    }

    #[test]
    fn test_hard_reset_while_connected_is_stale() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);
        let reset = server_packet(PacketCode::HardResetServerV2, 0, 0, &[], None);
        let err = core.receive_link(vec![reset], start).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err.root(), VpnError::StaleSession));
    }

    #[test]
    fn test_ping_timeout() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);
        let last_received = start + Duration::from_secs(1);

        let actions = core
            .receive_tunnel(vec![Bytes::from_static(b"ip packet")], last_received + Duration::from_secs(30))
            .unwrap();
        assert!(actions
            .iter()
            .any(|action| matches!(action, SessionAction::SendToLink(packets) if packets.len() == 1)));
        assert_eq!(core.data_count().outbound, 9);

        // ping-restart 60
        let err = core
            .receive_tunnel(vec![Bytes::from_static(b"ip packet")], last_received + Duration::from_secs(61))
            .unwrap_err();
        assert!(matches!(err, VpnError::PingTimeout));
        assert!(!err.allows_exit_notify());
    }

    #[test]
    fn test_zero_ping_restart_uses_default_timeout() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        let reply = PUSH_REPLY.replace("ping-restart 60", "ping-restart 0");
        connect_with(&mut core, start, &reply);
        assert_eq!(core.state(), SessionState::Started);
        let last_received = start + Duration::from_secs(1);

        for elapsed in [1, 61, 119] {
            core.receive_tunnel(
                vec![Bytes::from_static(b"ip packet")],
                last_received + Duration::from_secs(elapsed),
            )
            .unwrap();
        }
        assert!(core.ping_tick(last_received + Duration::from_secs(119)).is_ok());

        // ping_timeout defaults to 120s
        let err = core.ping_tick(last_received + Duration::from_secs(121)).unwrap_err();
        assert!(matches!(err, VpnError::PingTimeout));
    }

    #[test]
    fn test_zero_configured_timeout_uses_default_timeout() {
        let start = Instant::now();
        let configuration = Configuration {
            keep_alive_timeout: Some(0),
            ..test_configuration()
        };
        let mut core = core_with(configuration, Sent::default());
        let reply = PUSH_REPLY.replace(",ping-restart 60", "");
        connect_with(&mut core, start, &reply);
        let last_received = start + Duration::from_secs(1);

        assert!(core.ping_tick(last_received + Duration::from_secs(90)).is_ok());
        let err = core.ping_tick(last_received + Duration::from_secs(121)).unwrap_err();
        assert!(matches!(err, VpnError::PingTimeout));
    }

    #[test]
    fn test_session_with_configured_cbc_cipher() {
        let start = Instant::now();
        let configuration = Configuration {
            cipher: Some(crate::config::Cipher::Aes128Cbc),
            digest: Some(crate::config::Digest::Sha256),
            ..test_configuration()
        };
        let mut core = core_with(configuration, Sent::default());
        let reply = PUSH_REPLY.replace(",cipher AES-256-GCM", "");
        connect_with(&mut core, start, &reply);
        assert_eq!(core.state(), SessionState::Started);

        let actions = core
            .receive_tunnel(vec![Bytes::from_static(b"ip packet")], start + Duration::from_secs(2))
            .unwrap();
        let sent = actions
            .iter()
            .find_map(|action| match action {
                SessionAction::SendToLink(packets) => Some(packets),
                _ => None,
            })
            .unwrap();
        // DATA_V2 header, SHA-256 HMAC, IV and one padded block
        assert_eq!(sent[0].len(), 4 + 32 + 16 + 16);
    }

    #[test]
    fn test_ping_tick_sends_keepalive() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);

        let actions = core.ping_tick(start + Duration::from_secs(11)).unwrap();
        assert!(matches!(&actions[0], SessionAction::SendToLink(packets) if packets.len() == 1));
        assert!(matches!(actions[1], SessionAction::SchedulePing { after } if after == Duration::from_secs(10)));
    }

    #[test]
    fn test_tunnel_packets_dropped_before_connect() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        assert!(core.receive_tunnel(vec![Bytes::from_static(b"early")], start).unwrap().is_empty());
        core.set_link(udp_link(), start).unwrap();
        assert!(core.receive_tunnel(vec![Bytes::from_static(b"early")], start).unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_sends_exit_once() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);

        let exit = core.begin_shutdown(None).unwrap();
        assert_eq!(exit.len(), 1);
        assert_eq!(core.state(), SessionState::Stopping);
        assert!(core.begin_shutdown(None).is_none());
        assert!(core.receive_link(Vec::new(), start).unwrap().is_empty());

        let report = core.finish_shutdown(None);
        assert!(!report.should_reconnect);
        assert_eq!(core.state(), SessionState::Stopped);
        assert!(core.data_channel_keys().is_empty());
        assert!(core.begin_shutdown(None).is_none());
    }

    #[test]
    fn test_fatal_errors_skip_exit_notify() {
        let start = Instant::now();
        let mut core = core_with(test_configuration(), Sent::default());
        connect(&mut core, start);
        let exit = core.begin_shutdown(Some(&VpnError::SessionMismatch)).unwrap();
        assert!(exit.is_empty());
    }

    #[test]
    fn test_local_options_dropped_after_auth_failure() {
        let start = Instant::now();
        let sent = Sent::default();
        let mut core = core_with(test_configuration(), Arc::clone(&sent));
        core.set_link(udp_link(), start).unwrap();
        assert!(core.begin_shutdown(Some(&VpnError::BadCredentialsWithLocalOptions)).unwrap().is_empty());
        let report = core.finish_shutdown(Some(VpnError::BadCredentialsWithLocalOptions));
        assert!(report.should_reconnect);

        connect(&mut core, start);
        let sent = sent.lock().unwrap();
        let request = String::from_utf8_lossy(&sent[0]);
        assert!(request.contains("V0 UNDEF"));
    }
}
