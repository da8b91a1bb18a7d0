//! Broker connection worker built on a statum state machine.
//!
//! One task owns the rumqttc client and event loop and walks the
//! lifecycle `Closed → Connecting → Connected ⇄ Reconnecting`. Everything
//! else talks to it through [`MqttHandle`]: subscribe and publish become
//! commands, the coarse [`LinkState`] is mirrored into a watch channel.
//!
//! Reconnection uses exponential backoff starting at 5 s, doubling up to
//! 5 min, until the link is back or `disconnect()` is called. Routes
//! survive the reconnect and are re-subscribed before processing resumes.

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{matches, LinkState, TransportError};
use crate::config::{broker_address, ConfigError, MqttSection};
use crate::metrics::Metrics;

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
/// Broker-facing operations give up after this long.
const OP_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_QUEUE: usize = 256;
const CLIENT_QUEUE: usize = 64;

/// A message received from the broker, as delivered to a route.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Connection parameters distilled from the `mqtt` config section.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl LinkSettings {
    pub fn from_config(mqtt: &MqttSection) -> Result<Self, ConfigError> {
        let (host, port) = broker_address(&mqtt.broker)?;
        Ok(Self {
            host,
            port,
            client_id: mqtt.client_id.clone(),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
        })
    }
}

enum Command {
    Subscribe {
        pattern: String,
        route: mpsc::Sender<InboundMessage>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Publish {
        topic: String,
        payload: String,
        retain: bool,
    },
    Disconnect,
}

struct Route {
    pattern: String,
    tx: mpsc::Sender<InboundMessage>,
}

/// Cloneable front door to the transport worker.
#[derive(Clone)]
pub struct MqttHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<LinkState>,
}

impl MqttHandle {
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch receiver for state transitions (used by the subscription
    /// manager and the dashboard).
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Registers `route` for `pattern` and subscribes at the broker.
    /// First-match-wins against previously registered patterns; a repeat
    /// registration of the same pattern replaces the route.
    pub async fn subscribe(
        &self,
        pattern: &str,
        route: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        if self.state() != LinkState::Connected {
            return Err(TransportError::NotConnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe {
                pattern: pattern.to_string(),
                route,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::WorkerGone)?;

        match tokio::time::timeout(OP_TIMEOUT, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::WorkerGone),
            Err(_) => Err(TransportError::Timeout(OP_TIMEOUT)),
        }
    }

    /// Fire-and-forget QoS 0 publish.
    pub fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<(), TransportError> {
        if self.state() != LinkState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.cmd_tx
            .try_send(Command::Publish {
                topic: topic.to_string(),
                payload,
                retain,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::PublishRejected {
                    topic: topic.to_string(),
                    detail: "command queue full".to_string(),
                },
                mpsc::error::TrySendError::Closed(_) => TransportError::WorkerGone,
            })
    }

    /// Closes the link and cancels any retry in progress.
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect).await;
    }

    /// Handle wired to a stub worker that records publishes instead of
    /// talking to a broker. Test support.
    #[cfg(test)]
    pub(crate) fn loopback() -> (Self, mpsc::UnboundedReceiver<(String, String, bool)>) {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);
        let (pub_tx, pub_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let _state_tx = state_tx;
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    Command::Publish {
                        topic,
                        payload,
                        retain,
                    } => {
                        let _ = pub_tx.send((topic, payload, retain));
                    }
                    Command::Subscribe { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    Command::Disconnect => break,
                }
            }
        });
        (MqttHandle { cmd_tx, state_rx }, pub_rx)
    }
}

#[state]
#[derive(Debug, Clone, Copy)]
pub enum LinkPhase {
    Closed,
    Connecting,
    Connected,
    Reconnecting,
}

#[machine]
pub struct MqttLink<LinkPhase> {
    settings: LinkSettings,
    cmd_rx: mpsc::Receiver<Command>,
    routes: Vec<Route>,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    state_tx: watch::Sender<LinkState>,
    backoff: Duration,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

/// Manual `TransitionTo` impls: the lifecycle's transition points return a
/// multi-variant enum (`Dial`/`Session`/`Retry`), which `#[transition]`
/// cannot validate (it only accepts a bare/`Option`/`Result`-wrapped
/// `MqttLink<NextState>` return type), so the trait is implemented by hand
/// instead of via the attribute macro.
macro_rules! impl_transition {
    ($from:ty => $to:ty) => {
        impl TransitionTo<$to> for MqttLink<$from> {
            fn transition(self) -> MqttLink<$to> {
                MqttLink {
                    marker: core::marker::PhantomData,
                    state_data: (),
                    settings: self.settings,
                    cmd_rx: self.cmd_rx,
                    routes: self.routes,
                    client: self.client,
                    event_loop: self.event_loop,
                    state_tx: self.state_tx,
                    backoff: self.backoff,
                    cancel: self.cancel,
                    metrics: self.metrics,
                }
            }
        }
    };
}

impl_transition!(Closed => Connecting);
impl_transition!(Connecting => Closed);
impl_transition!(Connecting => Connected);
impl_transition!(Connected => Reconnecting);
impl_transition!(Reconnecting => Connected);

enum Dial {
    Up(MqttLink<Connected>),
    Failed(MqttLink<Closed>),
    Shutdown,
}

enum Session {
    Lost(MqttLink<Reconnecting>),
    Shutdown,
}

enum Retry {
    Up(MqttLink<Connected>),
    Shutdown,
}

impl MqttLink<Closed> {
    fn create(
        settings: LinkSettings,
        cmd_rx: mpsc::Receiver<Command>,
        state_tx: watch::Sender<LinkState>,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::builder()
            .settings(settings)
            .cmd_rx(cmd_rx)
            .routes(Vec::new())
            .client(None)
            .event_loop(None)
            .state_tx(state_tx)
            .backoff(INITIAL_BACKOFF)
            .cancel(cancel)
            .metrics(metrics)
            .build()
    }

    /// Builds a fresh client and enters the connect phase.
    fn begin(mut self) -> MqttLink<Connecting> {
        let mut options =
            MqttOptions::new(&self.settings.client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(Duration::from_secs(5));
        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username.clone(),
                self.settings.password.clone().unwrap_or_default(),
            );
        }

        let (client, event_loop) = AsyncClient::new(options, CLIENT_QUEUE);
        self.client = Some(client);
        self.event_loop = Some(event_loop);
        let _ = self.state_tx.send(LinkState::Connecting);
        info!(
            "connecting to mqtt broker {}:{}",
            self.settings.host, self.settings.port
        );
        self.transition()
    }

    /// Sits out the backoff before the next connect attempt, still
    /// answering commands. Returns false when asked to shut down.
    async fn wait_backoff(&mut self) -> bool {
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        warn!("broker unreachable, retrying in {:?}", delay);

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Disconnect) => return false,
                    Some(cmd) => reject_not_connected(cmd),
                },
            }
        }
    }
}

/// Outcome of one `select` round, resolved before any state is touched.
/// Keeps the select arms free of `&mut self` calls while other branch
/// futures still borrow fields.
enum Step {
    Cancelled,
    DeadlineHit,
    Cmd(Option<Command>),
    Event(Result<Event, rumqttc::ConnectionError>),
}

impl MqttLink<Connecting> {
    /// Polls the event loop until the broker acknowledges the session.
    async fn establish(mut self) -> Dial {
        let mut event_loop = match self.event_loop.take() {
            Some(el) => el,
            None => return Dial::Shutdown,
        };
        let deadline = tokio::time::sleep(OP_TIMEOUT);
        tokio::pin!(deadline);

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = &mut deadline => Step::DeadlineHit,
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                event = event_loop.poll() => Step::Event(event),
            };
            match step {
                Step::Cancelled => return Dial::Shutdown,
                Step::DeadlineHit => {
                    self.metrics
                        .transport_errors
                        .with_label_values(&["connect"])
                        .inc();
                    warn!("broker did not answer within {:?}", OP_TIMEOUT);
                    let _ = self.state_tx.send(LinkState::Closed);
                    return Dial::Failed(self.transition());
                }
                Step::Cmd(None) | Step::Cmd(Some(Command::Disconnect)) => return Dial::Shutdown,
                Step::Cmd(Some(cmd)) => reject_not_connected(cmd),
                Step::Event(Ok(Event::Incoming(Packet::ConnAck(ack))))
                    if ack.code == ConnectReturnCode::Success =>
                {
                    info!("mqtt session established");
                    let _ = self.state_tx.send(LinkState::Connected);
                    self.backoff = INITIAL_BACKOFF;
                    self.event_loop = Some(event_loop);
                    return Dial::Up(self.transition());
                }
                Step::Event(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    self.metrics
                        .transport_errors
                        .with_label_values(&["connect"])
                        .inc();
                    error!("broker refused connection: {:?}", ack.code);
                    let _ = self.state_tx.send(LinkState::Closed);
                    return Dial::Failed(self.transition());
                }
                Step::Event(Ok(_)) => {}
                Step::Event(Err(e)) => {
                    self.metrics
                        .transport_errors
                        .with_label_values(&["connect"])
                        .inc();
                    warn!("connect failed: {}", e);
                    let _ = self.state_tx.send(LinkState::Closed);
                    return Dial::Failed(self.transition());
                }
            }
        }
    }
}

impl MqttLink<Connected> {
    /// Re-issues broker subscriptions for every registered route.
    async fn resume(&mut self) {
        let Some(client) = self.client.clone() else {
            return;
        };
        for route in &self.routes {
            if let Err(e) = client.subscribe(&route.pattern, QoS::AtMostOnce).await {
                self.metrics
                    .transport_errors
                    .with_label_values(&["subscribe"])
                    .inc();
                warn!("re-subscribe of '{}' failed: {}", route.pattern, e);
            }
        }
    }

    /// Main processing loop: routes inbound publishes, executes commands,
    /// and leaves for `Reconnecting` when the link drops.
    async fn process(mut self) -> Session {
        let mut event_loop = match self.event_loop.take() {
            Some(el) => el,
            None => return Session::Shutdown,
        };

        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                cmd = self.cmd_rx.recv() => Step::Cmd(cmd),
                event = event_loop.poll() => Step::Event(event),
            };
            match step {
                Step::Cancelled | Step::Cmd(None) | Step::Cmd(Some(Command::Disconnect)) => {
                    self.close().await;
                    return Session::Shutdown;
                }
                Step::DeadlineHit => {}
                Step::Cmd(Some(Command::Subscribe {
                    pattern,
                    route,
                    reply,
                })) => {
                    let result = self.do_subscribe(pattern, route).await;
                    let _ = reply.send(result);
                }
                Step::Cmd(Some(Command::Publish {
                    topic,
                    payload,
                    retain,
                })) => {
                    self.do_publish(topic, payload, retain).await;
                }
                Step::Event(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                    self.dispatch(publish.topic, publish.payload.to_vec());
                }
                Step::Event(Ok(Event::Incoming(Packet::SubAck(ack)))) => {
                    // Rejections surface here; rumqttc acks are not
                    // correlated back to the pattern.
                    for code in &ack.return_codes {
                        if matches!(code, rumqttc::SubscribeReasonCode::Failure) {
                            self.metrics
                                .transport_errors
                                .with_label_values(&["subscribe"])
                                .inc();
                            warn!("broker rejected a subscription");
                        }
                    }
                }
                Step::Event(Ok(_)) => {}
                Step::Event(Err(e)) => {
                    warn!("mqtt link lost: {}", e);
                    let _ = self.state_tx.send(LinkState::Reconnecting);
                    self.event_loop = Some(event_loop);
                    return Session::Lost(self.transition());
                }
            }
        }
    }

    async fn do_subscribe(
        &mut self,
        pattern: String,
        route: mpsc::Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::NotConnected)?;
        match tokio::time::timeout(OP_TIMEOUT, client.subscribe(&pattern, QoS::AtMostOnce)).await {
            Ok(Ok(())) => {
                match self.routes.iter_mut().find(|r| r.pattern == pattern) {
                    Some(existing) => existing.tx = route,
                    None => self.routes.push(Route { pattern: pattern.clone(), tx: route }),
                }
                debug!("subscribed to '{}'", pattern);
                Ok(())
            }
            Ok(Err(e)) => {
                self.metrics
                    .transport_errors
                    .with_label_values(&["subscribe"])
                    .inc();
                Err(TransportError::SubscribeRejected {
                    pattern,
                    detail: e.to_string(),
                })
            }
            Err(_) => Err(TransportError::Timeout(OP_TIMEOUT)),
        }
    }

    async fn do_publish(&mut self, topic: String, payload: String, retain: bool) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        match tokio::time::timeout(
            OP_TIMEOUT,
            client.publish(&topic, QoS::AtMostOnce, retain, payload),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics
                    .transport_errors
                    .with_label_values(&["publish"])
                    .inc();
                warn!("publish to '{}' rejected: {}", topic, e);
            }
            Err(_) => {
                self.metrics
                    .transport_errors
                    .with_label_values(&["publish"])
                    .inc();
                warn!("publish to '{}' timed out", topic);
            }
        }
    }

    /// First-match-wins dispatch in registration order.
    fn dispatch(&self, topic: String, payload: Vec<u8>) {
        for route in &self.routes {
            if matches(&route.pattern, &topic) {
                if let Err(e) = route.tx.try_send(InboundMessage {
                    topic: topic.clone(),
                    payload,
                }) {
                    warn!("inbound route for '{}' is full: {}", route.pattern, e);
                }
                return;
            }
        }
        debug!("no route for inbound topic '{}'", topic);
    }

    async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        let _ = self.state_tx.send(LinkState::Closed);
        info!("mqtt link closed");
    }
}

impl MqttLink<Reconnecting> {
    /// Backoff-then-poll until the broker acknowledges a new session.
    async fn retry(mut self) -> Retry {
        loop {
            let delay = self.backoff;
            self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            warn!("mqtt reconnect in {:?}", delay);

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Retry::Shutdown,
                    _ = &mut sleep => break,
                    cmd = self.cmd_rx.recv() => match cmd {
                        None | Some(Command::Disconnect) => {
                            let _ = self.state_tx.send(LinkState::Closed);
                            return Retry::Shutdown;
                        }
                        Some(cmd) => reject_not_connected(cmd),
                    },
                }
            }

            let mut event_loop = match self.event_loop.take() {
                Some(el) => el,
                None => return Retry::Shutdown,
            };
            let deadline = tokio::time::sleep(OP_TIMEOUT);
            tokio::pin!(deadline);

            let outcome = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Retry::Shutdown,
                    _ = &mut deadline => break Err(()),
                    cmd = self.cmd_rx.recv() => match cmd {
                        None | Some(Command::Disconnect) => {
                            let _ = self.state_tx.send(LinkState::Closed);
                            return Retry::Shutdown;
                        }
                        Some(cmd) => reject_not_connected(cmd),
                    },
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(ack)))
                            if ack.code == ConnectReturnCode::Success => break Ok(()),
                        Ok(_) => {}
                        Err(e) => {
                            debug!("reconnect attempt failed: {}", e);
                            break Err(());
                        }
                    },
                }
            };

            self.event_loop = Some(event_loop);
            match outcome {
                Ok(()) => {
                    info!("mqtt session re-established");
                    self.backoff = INITIAL_BACKOFF;
                    let _ = self.state_tx.send(LinkState::Connected);
                    return Retry::Up(self.transition());
                }
                Err(()) => {
                    self.metrics
                        .transport_errors
                        .with_label_values(&["connect"])
                        .inc();
                }
            }
        }
    }
}

fn reject_not_connected(cmd: Command) {
    match cmd {
        Command::Subscribe { reply, pattern, .. } => {
            debug!("subscribe to '{}' while not connected", pattern);
            let _ = reply.send(Err(TransportError::NotConnected));
        }
        Command::Publish { topic, .. } => {
            debug!("dropping publish to '{}' while not connected", topic);
        }
        Command::Disconnect => {}
    }
}

/// Spawns the transport worker and returns its handle.
pub struct MqttWorker;

impl MqttWorker {
    pub fn spawn(
        settings: LinkSettings,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> (MqttHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state_rx) = watch::channel(LinkState::Closed);
        let handle = MqttHandle { cmd_tx, state_rx };

        let task = tokio::spawn(async move {
            enum Phase {
                Closed(MqttLink<Closed>),
                Connected(MqttLink<Connected>),
            }

            let mut phase = Phase::Closed(MqttLink::create(
                settings, cmd_rx, state_tx, cancel, metrics,
            ));

            loop {
                phase = match phase {
                    Phase::Closed(link) => match link.begin().establish().await {
                        Dial::Up(connected) => Phase::Connected(connected),
                        Dial::Failed(mut closed) => {
                            if closed.wait_backoff().await {
                                Phase::Closed(closed)
                            } else {
                                break;
                            }
                        }
                        Dial::Shutdown => break,
                    },
                    Phase::Connected(mut connected) => {
                        connected.resume().await;
                        match connected.process().await {
                            Session::Shutdown => break,
                            Session::Lost(reconnecting) => match reconnecting.retry().await {
                                Retry::Up(connected) => Phase::Connected(connected),
                                Retry::Shutdown => break,
                            },
                        }
                    }
                };
            }
            info!("mqtt transport worker stopped");
        });

        (handle, task)
    }
}
