//! Connection supervisor.
//!
//! Each [`Supervisor`] is a cheap handle to one background task that owns the
//! transport, the [`Session`], the negotiator, the liveness monitor and the
//! dispatcher. Callers talk to the task over a channel, so every write to the
//! transport happens on that task.
//!
//! Commands sent while the link is being established wait in the channel and
//! go out once the session is ready. Commands sent while the task is waiting
//! to reconnect, or after an explicit disconnect, fail with
//! [`SessionError::Offline`].

use crate::codec::{Frame, FrameCodec, Role};
use crate::config::SessionConfig;
use crate::dispatcher::{Dispatcher, Reply, RetryPolicy};
use crate::error::{Result, SessionError};
use crate::liveness::{LivenessEvent, LivenessMonitor};
use crate::negotiator::Negotiator;
use crate::protocol::{self, Params, Protocol, StateUpdate};
use crate::session::{ConnectionState, Session};
use crate::transport::{BoxTransport, Connector, TcpConnector};
use futures_core::Stream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_stream::wrappers::WatchStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

const CONTROL_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// Notifications published by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: Option<SessionError> },
    State(StateUpdate),
}

enum Control {
    Connect,
    Disconnect,
    Reconnect,
    Send {
        cmd: u32,
        params: Params,
        reply: Reply,
    },
}

impl Control {
    fn reject(self, err: SessionError) {
        if let Control::Send { reply, .. } = self {
            let _ = reply.send(Err(err));
        }
    }
}

/// Link status shared with the handles.
#[derive(Debug, Clone)]
struct Link {
    state: ConnectionState,
    /// Completed connection attempts, successful or not.
    attempts: u64,
    last_error: Option<SessionError>,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempts: 0,
            last_error: None,
        }
    }
}

struct Inner {
    device_id: String,
    protocol: Arc<dyn Protocol>,
    tx: mpsc::Sender<Control>,
    link: watch::Receiver<Link>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to one supervised device session.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Spawns a session over TCP to `config.address:config.port`.
    pub fn new(config: SessionConfig) -> Result<Self> {
        if config.address.trim().is_empty() {
            return Err(SessionError::Config("address must not be empty".into()));
        }
        let protocol = protocol::for_config(&config)?;
        let connector = Arc::new(TcpConnector::new(config.address.clone(), config.port));
        Self::with_parts(config, protocol, connector)
    }

    /// Spawns a session with an explicit protocol and transport.
    /// Must be called within a tokio runtime.
    pub fn with_parts(
        config: SessionConfig,
        protocol: Arc<dyn Protocol>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        protocol.codec_config().validate()?;

        let (tx, rx) = mpsc::channel(CONTROL_CAPACITY);
        let (link_tx, link_rx) = watch::channel(Link::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let policy = RetryPolicy {
            max_retries: config.max_retries,
            timeout: config.command_timeout,
            backoff: config.retry_backoff,
        };
        let worker = Worker {
            device_id: config.device_id.clone(),
            session: Session::new(
                config.device_id.clone(),
                config.version.clone(),
                config.key_bytes(),
            ),
            dispatcher: Dispatcher::new(protocol.clone(), policy),
            protocol: protocol.clone(),
            connector,
            rx,
            link: link_tx,
            events: events.clone(),
            cancel: cancel.clone(),
            wanted: false,
            connected: false,
            failures: 0,
            config,
        };

        let device_id = worker.device_id.clone();
        let task = tokio::spawn(worker.run());
        Ok(Self {
            inner: Arc::new(Inner {
                device_id,
                protocol,
                tx,
                link: link_rx,
                events,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.borrow().state
    }

    /// The error that ended the most recent connection or connection attempt.
    pub fn last_error(&self) -> Option<SessionError> {
        self.inner.link.borrow().last_error.clone()
    }

    /// Asks the session to connect without waiting for the outcome.
    pub async fn start(&self) -> Result<()> {
        self.control(Control::Connect).await
    }

    /// Connects and waits until the session is ready or the attempt failed.
    /// Joins an attempt that is already in flight.
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.inner.link.clone();
        let seen = {
            let current = link.borrow_and_update();
            if current.state == ConnectionState::Ready {
                return Ok(());
            }
            current.attempts
        };
        self.control(Control::Connect).await?;
        Self::await_attempt(&mut link, |l| {
            l.state == ConnectionState::Ready || l.attempts > seen
        })
        .await
    }

    /// Drops the current link and connects again right away.
    pub async fn reconnect(&self) -> Result<()> {
        let mut link = self.inner.link.clone();
        let seen = link.borrow_and_update().attempts;
        self.control(Control::Reconnect).await?;
        Self::await_attempt(&mut link, |l| l.attempts > seen).await
    }

    /// Closes the link and stays offline until the next `connect`.
    pub async fn disconnect(&self) -> Result<()> {
        let mut link = self.inner.link.clone();
        self.control(Control::Disconnect).await?;
        link.wait_for(|l| l.state == ConnectionState::Disconnected)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Cancelled)
    }

    /// Sends a command and waits for its acknowledgment.
    ///
    /// Resolves with the acknowledging frame, or `None` for commands the
    /// protocol does not acknowledge.
    pub async fn send<C: Into<u32>>(&self, cmd: C, params: Params) -> Result<Option<Frame>> {
        let (reply, rx) = oneshot::channel();
        self.control(Control::Send {
            cmd: cmd.into(),
            params,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Cancelled)?
    }

    /// Asks the device for its full state; the answer arrives as events.
    pub async fn request_status(&self) -> Result<Option<Frame>> {
        let (cmd, params) = self
            .inner
            .protocol
            .status_request()
            .ok_or(SessionError::UnknownCommandType(0))?;
        self.send(cmd, params).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Events as a stream. Ends after the session is disposed.
    pub fn events(&self) -> impl Stream<Item = SessionEvent> + Send + 'static {
        let mut rx = self.inner.events.subscribe();
        let cancel = self.inner.cancel.clone();
        let device_id = self.inner.device_id.clone();
        async_stream::stream! {
            loop {
                let res = tokio::select! {
                    biased;
                    res = rx.recv() => res,
                    _ = cancel.cancelled() => break,
                };
                match res {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Event stream for {} lagged by {} events", device_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Connection state changes, starting with the current state.
    pub fn state_changes(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        WatchStream::new(self.inner.link.clone()).map(|l| l.state)
    }

    /// Stops the session for good. Pending commands fail with
    /// [`SessionError::Cancelled`]. Safe to call more than once.
    pub async fn dispose(&self) {
        info!("Disposing session {}", self.inner.device_id);
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    async fn control(&self, control: Control) -> Result<()> {
        self.inner
            .tx
            .send(control)
            .await
            .map_err(|_| SessionError::Cancelled)
    }

    async fn await_attempt(
        link: &mut watch::Receiver<Link>,
        done: impl FnMut(&Link) -> bool,
    ) -> Result<()> {
        let outcome = link
            .wait_for(done)
            .await
            .map_err(|_| SessionError::Cancelled)?
            .clone();
        if outcome.state == ConnectionState::Ready {
            Ok(())
        } else {
            Err(outcome.last_error.unwrap_or(SessionError::Offline))
        }
    }
}

type Wire = Framed<BoxTransport, FrameCodec>;

/// Why a live connection ended.
enum Exit {
    Stop,
    Disconnect,
    Reconnect,
    Lost(SessionError),
}

struct Worker {
    device_id: String,
    config: SessionConfig,
    protocol: Arc<dyn Protocol>,
    connector: Arc<dyn Connector>,
    session: Session,
    dispatcher: Dispatcher,
    rx: mpsc::Receiver<Control>,
    link: watch::Sender<Link>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    /// The caller wants a live link.
    wanted: bool,
    connected: bool,
    /// Consecutive failed or lost connections.
    failures: u32,
}

impl Worker {
    async fn run(mut self) {
        debug!("Starting session task for {}", self.device_id);

        loop {
            if !self.wanted {
                if !self.wait_for_connect().await {
                    break;
                }
                continue;
            }

            let cancel = self.cancel.clone();
            let established = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.establish() => res,
            };
            let exit = match established {
                Ok(wire) => {
                    self.failures = 0;
                    self.finish_attempt(None);
                    self.maintain(wire).await
                }
                Err(e) => {
                    self.finish_attempt(Some(e.clone()));
                    Exit::Lost(e)
                }
            };

            match exit {
                Exit::Stop => break,
                Exit::Disconnect => {
                    info!("Disconnecting {} on request", self.device_id);
                    self.handle_disconnect(None);
                    self.wanted = false;
                }
                Exit::Reconnect => {
                    info!("Reconnecting {} on request", self.device_id);
                    self.handle_disconnect(None);
                }
                Exit::Lost(e) => {
                    self.handle_disconnect(Some(e));
                    self.failures += 1;
                    if matches!(self.config.max_reconnect_attempts, Some(max) if self.failures > max)
                    {
                        error!(
                            "Giving up on {} after {} failed connections",
                            self.device_id, self.failures
                        );
                        self.wanted = false;
                        continue;
                    }
                    if !self.wait_for_backoff().await {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.session.set_state(state);
        self.link.send_modify(|l| l.state = state);
    }

    fn finish_attempt(&mut self, error: Option<SessionError>) {
        let state = self.session.state();
        self.link.send_modify(|l| {
            l.attempts += 1;
            l.state = if error.is_some() {
                ConnectionState::Disconnected
            } else {
                state
            };
            l.last_error = error;
        });
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn handle_disconnect(&mut self, reason: Option<SessionError>) {
        self.dispatcher.cancel_all(&SessionError::Offline);
        self.session.reset();
        self.link.send_modify(|l| {
            l.state = ConnectionState::Disconnected;
            if let Some(e) = &reason {
                l.last_error = Some(e.clone());
            }
        });

        match &reason {
            Some(e) if e.is_negotiation() => warn!(
                "Device {} possibly has key or version mismatch (version {}): {}",
                self.device_id,
                self.session.protocol_version(),
                e
            ),
            Some(e) => debug!("Connection lost for device {}: {}", self.device_id, e),
            None => debug!("Connection closed normally for device {}", self.device_id),
        }
        if std::mem::take(&mut self.connected) {
            self.emit(SessionEvent::Disconnected { reason });
        }
    }

    fn shutdown(&mut self) {
        self.dispatcher.cancel_all(&SessionError::Cancelled);
        self.rx.close();
        while let Ok(control) = self.rx.try_recv() {
            control.reject(SessionError::Cancelled);
        }
        self.handle_disconnect(None);
        debug!("Session task for {} exited", self.device_id);
    }

    /// Idle until a connect is requested. Returns false when the task should stop.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                control = self.rx.recv() => match control {
                    None => return false,
                    Some(Control::Connect | Control::Reconnect) => {
                        self.wanted = true;
                        self.failures = 0;
                        return true;
                    }
                    Some(Control::Disconnect) => {}
                    Some(other) => {
                        debug!("Rejecting command for offline device {}", self.device_id);
                        other.reject(SessionError::Offline);
                    }
                },
            }
        }
    }

    /// Waits out the reconnect interval. Returns false when the task should stop.
    async fn wait_for_backoff(&mut self) -> bool {
        let interval = self.config.reconnect_interval;
        warn!(
            "Waiting {:?} before reconnecting {} (failures: {})",
            interval, self.device_id, self.failures
        );
        let delay = sleep(interval);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return true,
                _ = self.cancel.cancelled() => return false,
                control = self.rx.recv() => match control {
                    None => return false,
                    Some(Control::Connect) => {}
                    Some(Control::Reconnect) => return true,
                    Some(Control::Disconnect) => {
                        self.wanted = false;
                        return true;
                    }
                    Some(other) => {
                        debug!("Rejecting command during backoff for device {}", self.device_id);
                        other.reject(SessionError::Offline);
                    }
                },
            }
        }
    }

    async fn establish(&mut self) -> Result<Wire> {
        self.set_state(ConnectionState::Connecting);
        info!(
            "Connecting to {} at {}",
            self.device_id,
            self.connector.endpoint()
        );
        let transport = timeout(self.config.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| SessionError::ConnectionFailed)??;

        let codec = FrameCodec::new(
            self.protocol.codec_config(),
            Role::Controller,
            self.session.pre_shared_key(),
        );
        let mut wire = Framed::new(transport, codec);
        self.dispatcher.reset();

        self.set_state(ConnectionState::Negotiating);
        timeout(self.config.handshake_timeout, self.negotiate(&mut wire))
            .await
            .map_err(|_| {
                warn!("Handshake with {} timed out", self.device_id);
                SessionError::NegotiationTimeout
            })??;

        self.set_state(ConnectionState::Ready);
        self.connected = true;
        info!("Session with {} is ready", self.device_id);
        self.emit(SessionEvent::Connected);
        Ok(wire)
    }

    async fn negotiate(&mut self, wire: &mut Wire) -> Result<()> {
        let mut negotiator = Negotiator::new(
            self.protocol.negotiation(),
            Role::Controller,
            self.session.pre_shared_key(),
        );
        let Some(hello) = negotiator.start()? else {
            return Ok(());
        };
        debug!("Starting session key negotiation with {}", self.device_id);
        self.send_handshake(wire, hello).await?;

        while !negotiator.is_complete() {
            let frame = match wire.next().await {
                Some(Ok(Ok(frame))) => frame,
                Some(Ok(Err(e))) => {
                    return Err(negotiator.fail(&format!("unreadable handshake frame: {}", e)));
                }
                Some(Err(e)) => return Err(e),
                None => return Err(negotiator.fail("connection closed during handshake")),
            };
            if let Some(reply) = negotiator.on_frame(&frame)? {
                self.send_handshake(wire, reply).await?;
            }
        }

        negotiator.complete(&mut self.session)?;
        wire.codec_mut().set_key(self.session.session_key());
        Ok(())
    }

    async fn send_handshake(&mut self, wire: &mut Wire, frame: Frame) -> Result<()> {
        let sent = self.dispatcher.send(
            &self.session,
            frame.cmd,
            &Params::Raw(frame.payload),
            None,
            Instant::now(),
        )?;
        if let Some(frame) = sent {
            wire.send(frame).await?;
        }
        Ok(())
    }

    async fn maintain(&mut self, mut wire: Wire) -> Exit {
        let now = Instant::now();
        let mut liveness =
            LivenessMonitor::new(self.config.heartbeat_interval, self.config.idle_timeout, now);
        let mut malformed = 0u32;
        let mut poll = self.config.poll_interval.map(|period| {
            let mut interval = interval_at(now + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        if self.config.request_status_on_connect {
            if let Some((cmd, params)) = self.protocol.status_request() {
                if let Err(e) = self.dispatch(&mut wire, &mut liveness, cmd, params, None).await {
                    return Exit::Lost(e);
                }
            }
        }

        loop {
            let liveness_at = liveness.next_deadline();
            let retry_at = self.dispatcher.next_deadline();

            tokio::select! {
                _ = self.cancel.cancelled() => return Exit::Stop,
                control = self.rx.recv() => match control {
                    None => {
                        debug!("All handles for {} dropped, stopping task", self.device_id);
                        return Exit::Stop;
                    }
                    Some(Control::Connect) => {}
                    Some(Control::Disconnect) => return Exit::Disconnect,
                    Some(Control::Reconnect) => return Exit::Reconnect,
                    Some(Control::Send { cmd, params, reply }) => {
                        if let Err(e) = self.dispatch(&mut wire, &mut liveness, cmd, params, Some(reply)).await {
                            return Exit::Lost(e);
                        }
                    }
                },
                item = wire.next() => match item {
                    None => return Exit::Lost(SessionError::Io("Connection closed by peer".into())),
                    Some(Err(e)) => return Exit::Lost(e),
                    Some(Ok(Err(e))) => {
                        if let Some(exit) = self.on_malformed(&mut malformed, e) {
                            return exit;
                        }
                    }
                    Some(Ok(Ok(frame))) => {
                        liveness.on_received(Instant::now());
                        match self.on_frame(&mut wire, &mut liveness, frame).await {
                            Ok(()) => malformed = 0,
                            Err(e) if e.is_transport() => return Exit::Lost(e),
                            Err(e) if e.is_malformed_frame() => {
                                if let Some(exit) = self.on_malformed(&mut malformed, e) {
                                    return exit;
                                }
                            }
                            Err(e) => {
                                warn!("Frame from {} not handled: {}", self.device_id, e);
                                malformed = 0;
                            }
                        }
                    }
                },
                _ = sleep_until(liveness_at) => match liveness.poll(Instant::now()) {
                    Some(LivenessEvent::SendHeartbeat) => {
                        debug!("Auto-heartbeat for device {}", self.device_id);
                        let (cmd, params) = self.protocol.heartbeat(&self.session);
                        if let Err(e) = self.dispatch(&mut wire, &mut liveness, cmd, params, None).await {
                            return Exit::Lost(e);
                        }
                        liveness.on_heartbeat_sent(Instant::now());
                    }
                    Some(LivenessEvent::Dead) => {
                        warn!(
                            "No data from {} for {:?}, dropping link",
                            self.device_id, self.config.idle_timeout
                        );
                        return Exit::Lost(SessionError::Io("receive idle timeout".into()));
                    }
                    None => {}
                },
                _ = sleep_until(retry_at.unwrap_or(liveness_at)), if retry_at.is_some() => {
                    for frame in self.dispatcher.on_timer(Instant::now()) {
                        if let Err(e) = self.write(&mut wire, &mut liveness, frame).await {
                            return Exit::Lost(e);
                        }
                    }
                },
                _ = tick(&mut poll) => {
                    if let Some((cmd, params)) = self.protocol.status_request() {
                        debug!("Polling status of {}", self.device_id);
                        if let Err(e) = self.dispatch(&mut wire, &mut liveness, cmd, params, None).await {
                            return Exit::Lost(e);
                        }
                    }
                },
            }
        }
    }

    /// Sends a command through the dispatcher. Only transport failures are
    /// returned; command failures go to the caller's reply.
    async fn dispatch(
        &mut self,
        wire: &mut Wire,
        liveness: &mut LivenessMonitor,
        cmd: u32,
        params: Params,
        reply: Option<Reply>,
    ) -> Result<()> {
        match self
            .dispatcher
            .send(&self.session, cmd, &params, reply, Instant::now())
        {
            Ok(Some(frame)) => self.write(wire, liveness, frame).await,
            Ok(None) => Ok(()),
            Err(e) => {
                debug!(
                    "Command 0x{:02X} for {} rejected: {}",
                    cmd, self.device_id, e
                );
                Ok(())
            }
        }
    }

    async fn write(
        &mut self,
        wire: &mut Wire,
        liveness: &mut LivenessMonitor,
        frame: Frame,
    ) -> Result<()> {
        match timeout(self.config.connect_timeout, wire.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_transport() => return Err(e),
            Ok(Err(e)) => {
                warn!("Could not encode frame for {}: {}", self.device_id, e);
                return Ok(());
            }
            Err(_) => return Err(SessionError::Io("write timed out".into())),
        }
        liveness.on_sent(Instant::now());
        Ok(())
    }

    /// Acknowledges, resolves and publishes one inbound frame, in that order.
    async fn on_frame(
        &mut self,
        wire: &mut Wire,
        liveness: &mut LivenessMonitor,
        frame: Frame,
    ) -> Result<()> {
        let inbound = self
            .dispatcher
            .on_frame(&self.session, frame, Instant::now())?;
        if let Some(ack) = inbound.ack {
            self.write(wire, liveness, ack).await?;
        }
        for frame in inbound.released {
            self.write(wire, liveness, frame).await?;
        }
        for update in inbound.updates {
            self.emit(SessionEvent::State(update));
        }
        for (cmd, params) in inbound.follow_ups {
            self.dispatch(wire, liveness, cmd, params, None).await?;
        }
        Ok(())
    }

    fn on_malformed(&self, count: &mut u32, err: SessionError) -> Option<Exit> {
        *count += 1;
        warn!(
            "Dropping malformed frame from {} ({} in a row): {}",
            self.device_id, count, err
        );
        let threshold = self.config.malformed_threshold;
        (threshold > 0 && *count >= threshold).then(|| {
            Exit::Lost(SessionError::Io(format!(
                "{} consecutive malformed frames",
                count
            )))
        })
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
