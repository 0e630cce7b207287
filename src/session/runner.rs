//! Tokio driver of a [`SessionCore`]
//!
//! The core lives inside a single task fed by an event channel. Link and
//! tunnel reads run in their own tasks and wait for each batch to be
//! handled before reading again, timers are spawned sleeps that post an
//! event when they expire, and writes go through one writer task per
//! interface so packets leave in order without blocking the session.

use super::{Capabilities, DataCount, LinkInfo, SessionAction, SessionCore};
use crate::config::{Configuration, SocketType};
use crate::crypto::tls::TlsOptions;
use crate::error::{Result, VpnError};
use crate::protocol::push_reply::PushOptions;
use crate::tunnel::{Link, Tunnel};
use bytes::Bytes;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Session lifecycle notifications
pub trait SessionDelegate: Send + Sync {
    fn session_did_start(&self, remote_address: &str, remote_protocol: SocketType, options: &PushOptions);

    /// `should_reconnect` is set when a new link may be attached right away
    fn session_did_stop(&self, error: Option<&VpnError>, should_reconnect: bool);

    fn session_did_update_data_count(&self, _count: DataCount) {}
}

enum Event {
    SetLink(Arc<dyn Link>),
    SetTunnel(Arc<dyn Tunnel>),
    LinkPackets(Vec<Bytes>, oneshot::Sender<()>),
    TunnelPackets(Vec<Bytes>, oneshot::Sender<()>),
    NegotiationTick(u8),
    PingTick,
    Failure(VpnError),
    Shutdown(Option<VpnError>),
}

/// Handle to a running session
pub struct Session {
    events: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

impl Session {
    /// Session with the bundled rustls and crypto providers
    pub fn new(configuration: Configuration, delegate: Arc<dyn SessionDelegate>) -> Result<Self> {
        configuration.validate()?;
        let tls_options = TlsOptions::from_configuration(&configuration)?;
        Ok(Self::with_capabilities(
            configuration,
            tls_options,
            Capabilities::default(),
            delegate,
        ))
    }

    pub fn with_capabilities(
        configuration: Configuration,
        tls_options: TlsOptions,
        capabilities: Capabilities,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let core = SessionCore::new(Arc::new(configuration), tls_options, capabilities);
        let actor = Actor {
            core,
            delegate,
            events: events.clone(),
            link: None,
            link_tasks: Vec::new(),
            link_writer: None,
            tunnel_tasks: Vec::new(),
            tunnel_writer: None,
            negotiation_timers: HashMap::new(),
            ping_timer: None,
        };
        let task = tokio::spawn(actor.run(receiver));
        Self { events, task }
    }

    /// Start negotiating over `link`
    pub fn set_link(&self, link: Arc<dyn Link>) {
        self.post(Event::SetLink(link));
    }

    pub fn set_tunnel(&self, tunnel: Arc<dyn Tunnel>) {
        self.post(Event::SetTunnel(tunnel));
    }

    /// Stop the session, reporting `error` to the delegate
    pub fn shutdown(&self, error: Option<VpnError>) {
        self.post(Event::Shutdown(error));
    }

    fn post(&self, event: Event) {
        if self.events.send(event).is_err() {
            warn!("Session task is gone");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Actor {
    core: SessionCore,
    delegate: Arc<dyn SessionDelegate>,
    events: mpsc::UnboundedSender<Event>,
    link: Option<Arc<dyn Link>>,
    link_tasks: Vec<JoinHandle<()>>,
    link_writer: Option<mpsc::UnboundedSender<Vec<Bytes>>>,
    tunnel_tasks: Vec<JoinHandle<()>>,
    tunnel_writer: Option<mpsc::UnboundedSender<Vec<Bytes>>>,
    negotiation_timers: HashMap<u8, JoinHandle<()>>,
    ping_timer: Option<JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = receiver.recv().await {
            let now = Instant::now().into_std();
            let outcome = match event {
                Event::SetLink(link) => self.set_link(link, now),
                Event::SetTunnel(tunnel) => {
                    self.set_tunnel(tunnel);
                    Ok(Vec::new())
                }
                Event::LinkPackets(packets, done) => {
                    let outcome = self.core.receive_link(packets, now);
                    let _ = done.send(());
                    outcome
                }
                Event::TunnelPackets(packets, done) => {
                    let outcome = self.core.receive_tunnel(packets, now);
                    let _ = done.send(());
                    outcome
                }
                Event::NegotiationTick(key) => {
                    self.negotiation_timers.remove(&key);
                    self.core.negotiation_tick(key, now)
                }
                Event::PingTick => {
                    self.ping_timer = None;
                    self.core.ping_tick(now)
                }
                Event::Failure(err) => Err(err),
                Event::Shutdown(error) => {
                    self.shutdown(error).await;
                    continue;
                }
            };
            match outcome {
                Ok(actions) => self.perform(actions),
                Err(err) => self.shutdown(Some(err)).await,
            }
        }
    }

    fn set_link(&mut self, link: Arc<dyn Link>, now: std::time::Instant) -> Result<Vec<SessionAction>> {
        if self.link.is_some() {
            warn!("Link interface already set!");
            return Ok(Vec::new());
        }
        self.link = Some(Arc::clone(&link));
        let actions = self.core.set_link(LinkInfo::of(link.as_ref()), now)?;

        let reader = {
            let link = Arc::clone(&link);
            let events = self.events.clone();
            tokio::spawn(async move {
                loop {
                    match link.read_packets().await {
                        Ok(packets) => {
                            let (done, handled) = oneshot::channel();
                            if events.send(Event::LinkPackets(packets, done)).is_err() || handled.await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!("Link read failed: {err}");
                            let _ = events.send(Event::Failure(err));
                            break;
                        }
                    }
                }
            })
        };
        let (writer, writes) = mpsc::unbounded_channel();
        let write_task = spawn_writer(writes, self.events.clone(), {
            let link = Arc::clone(&link);
            move |packets| {
                let link = Arc::clone(&link);
                async move { link.write_packets(packets).await }
            }
        });

        self.link_tasks = vec![reader, write_task];
        self.link_writer = Some(writer);
        Ok(actions)
    }

    fn set_tunnel(&mut self, tunnel: Arc<dyn Tunnel>) {
        for task in self.tunnel_tasks.drain(..) {
            task.abort();
        }
        let reader = {
            let tunnel = Arc::clone(&tunnel);
            let events = self.events.clone();
            tokio::spawn(async move {
                loop {
                    match tunnel.read_packets().await {
                        Ok(packets) => {
                            let (done, handled) = oneshot::channel();
                            if events.send(Event::TunnelPackets(packets, done)).is_err() || handled.await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            error!("Tunnel read failed: {err}");
                            let _ = events.send(Event::Failure(err));
                            break;
                        }
                    }
                }
            })
        };
        let (writer, writes) = mpsc::unbounded_channel();
        let write_task = spawn_writer(writes, self.events.clone(), {
            let tunnel = Arc::clone(&tunnel);
            move |packets| {
                let tunnel = Arc::clone(&tunnel);
                async move { tunnel.write_packets(packets).await }
            }
        });
        self.tunnel_tasks = vec![reader, write_task];
        self.tunnel_writer = Some(writer);
    }

    fn perform(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::SendToLink(packets) => {
                    if let Some(writer) = &self.link_writer {
                        let _ = writer.send(packets);
                    }
                }
                SessionAction::SendToTunnel(packets) => match &self.tunnel_writer {
                    Some(writer) => {
                        let _ = writer.send(packets);
                    }
                    None => debug!("No tunnel, dropping {} packets", packets.len()),
                },
                SessionAction::ScheduleNegotiationTick { key, after } => {
                    let timer = self.schedule(after, Event::NegotiationTick(key));
                    if let Some(previous) = self.negotiation_timers.insert(key, timer) {
                        previous.abort();
                    }
                }
                SessionAction::SchedulePing { after } => {
                    let timer = self.schedule(after, Event::PingTick);
                    if let Some(previous) = self.ping_timer.replace(timer) {
                        previous.abort();
                    }
                }
                SessionAction::Started {
                    remote_address,
                    remote_protocol,
                    push_reply,
                } => self
                    .delegate
                    .session_did_start(&remote_address, remote_protocol, &push_reply.options),
                SessionAction::DataCount(count) => self.delegate.session_did_update_data_count(count),
            }
        }
    }

    fn schedule(&self, after: Duration, event: Event) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        })
    }

    async fn shutdown(&mut self, error: Option<VpnError>) {
        let Some(exit_packets) = self.core.begin_shutdown(error.as_ref()) else {
            debug!("Ignore shutdown, session is not running");
            return;
        };

        if let Some(link) = self.link.take() {
            if !exit_packets.is_empty() {
                let timeout = self.core.configuration().options.write_timeout();
                match tokio::time::timeout(timeout, link.write_packets(exit_packets)).await {
                    Ok(Ok(())) => debug!("Exit notification sent"),
                    Ok(Err(err)) => warn!("Exit notification failed: {err}"),
                    Err(_) => warn!("Exit notification timed out"),
                }
            }
            link.shutdown().await;
        }
        for task in self.link_tasks.drain(..) {
            task.abort();
        }
        self.link_writer = None;
        for task in self.tunnel_tasks.drain(..) {
            task.abort();
        }
        self.tunnel_writer = None;
        for (_, timer) in self.negotiation_timers.drain() {
            timer.abort();
        }
        if let Some(timer) = self.ping_timer.take() {
            timer.abort();
        }

        let report = self.core.finish_shutdown(error);
        info!("Session stopped");
        self.delegate
            .session_did_stop(report.error.as_ref(), report.should_reconnect);
    }
}

fn spawn_writer<F, Fut>(
    mut writes: mpsc::UnboundedReceiver<Vec<Bytes>>,
    events: mpsc::UnboundedSender<Event>,
    write: F,
) -> JoinHandle<()>
where
    F: Fn(Vec<Bytes>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(packets) = writes.recv().await {
            if let Err(err) = write(packets).await {
                error!("Write failed: {err}");
                let _ = events.send(Event::Failure(err));
                break;
            }
        }
    })
}
