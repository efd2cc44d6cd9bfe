//! Async client runtime. One task owns the coordinator and the broker; the
//! public handle talks to it over a command channel, so all session state is
//! mutated from a single place.

use std::collections::HashMap;
use std::time::Duration;

use composite_core::adapter::SnapshotHandler;
use composite_core::{
    Action, CompositeError, CoordinatorConfig, Event, EventKind, ListenerId, Location,
    RetainedListener, SessionCoordinator, SessionState, TimerKind, TimerSchedule, TransportAction,
};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::broker::{Broker, BrokerError, BrokerEvent};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Composite(#[from] CompositeError),
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
    #[error("client task has stopped")]
    Closed,
}

enum Command {
    Connect {
        url: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Join {
        data: Option<Map<String, Value>>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    SendData(Map<String, Value>),
    SendUpdate(Map<String, Value>),
    StartApp,
    EndApp,
    SyncTime,
    SetLocation(Location),
    On {
        kind: EventKind,
        listener: RetainedListener,
        reply: oneshot::Sender<ListenerId>,
    },
    Off {
        kind: EventKind,
        id: ListenerId,
        reply: oneshot::Sender<bool>,
    },
    OnPayload(SnapshotHandler),
    OnSessionLink(SnapshotHandler),
    State(oneshot::Sender<SessionState>),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running client task. Dropping every handle stops the task,
/// which disconnects and cancels its timers.
pub struct CompositeClient {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl CompositeClient {
    /// Spawn the client task on the current tokio runtime.
    pub fn spawn<B: Broker>(config: CoordinatorConfig, broker: B) -> Self {
        Self::spawn_with(SessionCoordinator::new(config), broker)
    }

    pub fn spawn_with<B: Broker>(coordinator: SessionCoordinator, broker: B) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (broker_events, broker_rx) = mpsc::unbounded_channel();
        let (fired, timer_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            coordinator,
            broker,
            broker_events,
            timers: Timers::new(fired),
        };
        let task = tokio::spawn(actor.run(command_rx, broker_rx, timer_rx));
        Self { commands, task }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.command(make(reply))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Open the broker connection. Resolves once the attempt is under way;
    /// the `init` event marks the device as registered.
    pub async fn connect(&self, url: &str) -> Result<(), ClientError> {
        let url = url.to_owned();
        self.request(|reply| Command::Connect { url, reply }).await?
    }

    pub async fn join(&self, data: Option<Map<String, Value>>) -> Result<(), ClientError> {
        self.request(|reply| Command::Join { data, reply }).await?
    }

    pub fn send_data(&self, payload: Map<String, Value>) -> Result<(), ClientError> {
        self.command(Command::SendData(payload))
    }

    pub fn send_update(&self, payload: Map<String, Value>) -> Result<(), ClientError> {
        self.command(Command::SendUpdate(payload))
    }

    pub fn start_app(&self) -> Result<(), ClientError> {
        self.command(Command::StartApp)
    }

    pub fn end_app(&self) -> Result<(), ClientError> {
        self.command(Command::EndApp)
    }

    pub fn sync_time(&self) -> Result<(), ClientError> {
        self.command(Command::SyncTime)
    }

    pub fn set_location(&self, location: Location) -> Result<(), ClientError> {
        self.command(Command::SetLocation(location))
    }

    pub async fn on<F>(&self, kind: EventKind, listener: F) -> Result<ListenerId, ClientError>
    where
        F: FnMut(&Event) + Send + 'static,
    {
        let mut listener = listener;
        self.on_while(kind, move |event: &Event| {
            listener(event);
            true
        })
        .await
    }

    /// Like `on`, but the listener is removed the first time it returns false.
    pub async fn on_while<F>(&self, kind: EventKind, listener: F) -> Result<ListenerId, ClientError>
    where
        F: FnMut(&Event) -> bool + Send + 'static,
    {
        let listener: RetainedListener = Box::new(listener);
        self.request(|reply| Command::On {
            kind,
            listener,
            reply,
        })
        .await
    }

    pub async fn off(&self, kind: EventKind, id: ListenerId) -> Result<bool, ClientError> {
        self.request(|reply| Command::Off { kind, id, reply }).await
    }

    /// Channel that receives a copy of every `kind` event. The listener goes
    /// away with the first event after the receiver is dropped.
    pub async fn events(&self, kind: EventKind) -> Result<mpsc::UnboundedReceiver<Event>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_while(kind, move |event: &Event| tx.send(event.clone()).is_ok())
            .await?;
        Ok(rx)
    }

    /// Handler for adapter-level `payload` messages.
    pub fn on_payload(&self, handler: SnapshotHandler) -> Result<(), ClientError> {
        self.command(Command::OnPayload(handler))
    }

    /// Handler for session-link snapshots.
    pub fn on_session_link(&self, handler: SnapshotHandler) -> Result<(), ClientError> {
        self.command(Command::OnSessionLink(handler))
    }

    pub async fn state(&self) -> Result<SessionState, ClientError> {
        self.request(Command::State).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(Command::Disconnect).await
    }

    /// Stop the task and wait for its teardown to finish.
    pub async fn shutdown(self) {
        let CompositeClient { commands, task } = self;
        drop(commands);
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "client task ended abnormally");
        }
    }
}

struct Actor<B> {
    coordinator: SessionCoordinator,
    broker: B,
    broker_events: mpsc::UnboundedSender<BrokerEvent>,
    timers: Timers,
}

impl<B: Broker> Actor<B> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut broker_rx: mpsc::UnboundedReceiver<BrokerEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<(TimerKind, u64)>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = broker_rx.recv() => self.on_broker_event(event),
                Some((timer, generation)) = timer_rx.recv() => {
                    if self.timers.is_current(timer, generation) {
                        let actions = self.coordinator.on_timer(timer);
                        self.perform_logged(actions);
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        let actions = self.coordinator.disconnect();
        self.perform_logged(actions);
        tracing::debug!("client task stopped");
    }

    fn on_broker_event(&mut self, event: BrokerEvent) {
        let actions = match event {
            BrokerEvent::Connected(frame) => self.coordinator.on_connected(&frame),
            BrokerEvent::ConnectFailed(frame) => self.coordinator.on_connect_failed(&frame),
            BrokerEvent::Message {
                subscription,
                frame,
            } => {
                if !self.coordinator.adapter().is_open() {
                    tracing::trace!(%subscription, "frame after close ignored");
                    return;
                }
                tracing::trace!(%subscription, "frame");
                self.coordinator.on_frame(&frame)
            }
        };
        self.perform_logged(actions);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, reply } => {
                let result = self
                    .coordinator
                    .connect(&url)
                    .map_err(ClientError::from)
                    .and_then(|actions| self.perform(actions).map_err(ClientError::from));
                let _ = reply.send(result);
            }
            Command::Join { data, reply } => {
                let result = self
                    .coordinator
                    .join(data)
                    .map_err(ClientError::from)
                    .and_then(|actions| self.perform(actions).map_err(ClientError::from));
                let _ = reply.send(result);
            }
            Command::SendData(payload) => {
                let actions = self.coordinator.send_data(payload);
                self.perform_logged(actions);
            }
            Command::SendUpdate(payload) => {
                let actions = self.coordinator.send_update(payload);
                self.perform_logged(actions);
            }
            Command::StartApp => {
                let actions = self.coordinator.start_app();
                self.perform_logged(actions);
            }
            Command::EndApp => {
                let actions = self.coordinator.end_app();
                self.perform_logged(actions);
            }
            Command::SyncTime => {
                let actions = self.coordinator.sync_time();
                self.perform_logged(actions);
            }
            Command::SetLocation(location) => self.coordinator.set_location(location),
            Command::On {
                kind,
                listener,
                reply,
            } => {
                let _ = reply.send(self.coordinator.on_while(kind, listener));
            }
            Command::Off { kind, id, reply } => {
                let _ = reply.send(self.coordinator.off(kind, id));
            }
            Command::OnPayload(handler) => self.coordinator.adapter_mut().set_payload_handler(handler),
            Command::OnSessionLink(handler) => {
                self.coordinator.adapter_mut().set_session_handler(handler)
            }
            Command::State(reply) => {
                let _ = reply.send(self.coordinator.state());
            }
            Command::Disconnect(reply) => {
                let actions = self.coordinator.disconnect();
                self.perform_logged(actions);
                let _ = reply.send(());
            }
        }
    }

    /// Run every action; the first broker error is returned after the rest ran.
    fn perform(&mut self, actions: Vec<Action>) -> Result<(), BrokerError> {
        let mut first_error = None;
        for action in actions {
            let result = match action {
                Action::Transport(action) => self.transport(action),
                Action::StartTimer(timer, schedule) => {
                    self.timers.start(timer, schedule);
                    Ok(())
                }
                Action::CancelTimer(timer) => {
                    self.timers.cancel(timer);
                    Ok(())
                }
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn perform_logged(&mut self, actions: Vec<Action>) {
        if let Err(e) = self.perform(actions) {
            tracing::warn!(error = %e, "broker action failed");
        }
    }

    fn transport(&mut self, action: TransportAction) -> Result<(), BrokerError> {
        match action {
            TransportAction::Open {
                url,
                credentials,
                heartbeat,
            } => self
                .broker
                .connect(&url, &credentials, heartbeat, self.broker_events.clone()),
            TransportAction::Subscribe { id, destination } => self.broker.subscribe(id, &destination),
            TransportAction::Send {
                destination,
                headers,
                body,
            } => self.broker.send(&destination, &headers, &body),
            TransportAction::Close => {
                self.broker.disconnect();
                Ok(())
            }
        }
    }
}

/// Running timer tasks, at most one per kind. Each tick carries the generation
/// it was started with so ticks from a cancelled timer are recognised.
struct Timers {
    fired: mpsc::UnboundedSender<(TimerKind, u64)>,
    running: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    generation: u64,
}

impl Timers {
    fn new(fired: mpsc::UnboundedSender<(TimerKind, u64)>) -> Self {
        Self {
            fired,
            running: HashMap::new(),
            generation: 0,
        }
    }

    fn start(&mut self, timer: TimerKind, schedule: TimerSchedule) {
        self.cancel(timer);
        if schedule == TimerSchedule::Every(Duration::ZERO) {
            tracing::warn!(?timer, "refusing to start a zero-period timer");
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        let fired = self.fired.clone();
        let handle = tokio::spawn(async move {
            match schedule {
                TimerSchedule::Once(delay) => {
                    time::sleep(delay).await;
                    let _ = fired.send((timer, generation));
                }
                TimerSchedule::Every(period) => {
                    let mut ticks = time::interval_at(Instant::now() + period, period);
                    loop {
                        ticks.tick().await;
                        if fired.send((timer, generation)).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        tracing::trace!(?timer, ?schedule, "timer started");
        self.running.insert(timer, (generation, handle));
    }

    fn cancel(&mut self, timer: TimerKind) {
        if let Some((_, handle)) = self.running.remove(&timer) {
            handle.abort();
            tracing::trace!(?timer, "timer cancelled");
        }
    }

    fn is_current(&self, timer: TimerKind, generation: u64) -> bool {
        self.running
            .get(&timer)
            .is_some_and(|(current, _)| *current == generation)
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.running.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use composite_core::protocol::{DEVICE_QUEUE, PING_DESTINATION};
    use composite_core::{
        encode_body_as, AdapterConfig, BodyEncoding, Credentials, Frame, Headers, Phase,
        SubscriptionId,
    };
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn single_encoding() -> CoordinatorConfig {
        CoordinatorConfig {
            adapter: AdapterConfig {
                encoding: BodyEncoding::Single,
                ..AdapterConfig::default()
            },
            encoding: BodyEncoding::Single,
            ..CoordinatorConfig::default()
        }
    }

    async fn registered(client: &CompositeClient) {
        let mut init = client.events(EventKind::Init).await.unwrap();
        client.connect("memory://composite").await.unwrap();
        init.recv().await.unwrap();
    }

    async fn joined(client: &CompositeClient) -> Option<usize> {
        let mut joined = client.events(EventKind::SessionJoined).await.unwrap();
        client.set_location(Location::new(48.85, 2.35)).unwrap();
        client.join(None).await.unwrap();
        match joined.recv().await.unwrap() {
            Event::SessionJoined(joined) => joined.player,
            other => panic!("expected session_joined, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_joiner_hosts_and_start_reaches_everyone() {
        let broker = MemoryBroker::new(BodyEncoding::Single);
        let a = CompositeClient::spawn(single_encoding(), broker.client());
        let b = CompositeClient::spawn(single_encoding(), broker.client());
        registered(&a).await;
        registered(&b).await;

        assert_eq!(joined(&a).await, Some(0));
        assert_eq!(joined(&b).await, Some(1));
        let state_a = a.state().await.unwrap();
        let state_b = b.state().await.unwrap();
        assert!(state_a.host);
        assert!(!state_b.host);
        assert_eq!(state_a.session, state_b.session);

        let mut start_a = a.events(EventKind::AppStart).await.unwrap();
        let mut start_b = b.events(EventKind::AppStart).await.unwrap();
        b.start_app().unwrap();
        a.start_app().unwrap();
        assert!(matches!(start_a.recv().await, Some(Event::AppStart { .. })));
        assert!(matches!(start_b.recv().await, Some(Event::AppStart { .. })));
        assert_eq!(a.state().await.unwrap().phase, Phase::Active { host: true });

        let mut data = a.events(EventKind::Data).await.unwrap();
        let mut payload = Map::new();
        payload.insert("score".into(), json!(7));
        b.send_data(payload).unwrap();
        match data.recv().await.unwrap() {
            Event::Data(received) => {
                assert_eq!(received["score"], 7);
                assert_eq!(received["me"], false);
                assert_eq!(received["uuid"], json!(state_b.uuid.unwrap().as_str()));
            }
            other => panic!("expected data, got {:?}", other),
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn host_leaving_promotes_next_device() {
        let broker = MemoryBroker::new(BodyEncoding::Single);
        let a = CompositeClient::spawn(single_encoding(), broker.client());
        let b = CompositeClient::spawn(single_encoding(), broker.client());
        registered(&a).await;
        registered(&b).await;
        joined(&a).await;
        joined(&b).await;

        let mut gone = b.events(EventKind::DeviceDisconnect).await.unwrap();
        a.disconnect().await.unwrap();
        gone.recv().await.unwrap();
        assert!(b.state().await.unwrap().host);
        assert_eq!(a.state().await.unwrap().phase, Phase::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_rejects_empty_endpoint() {
        let client = CompositeClient::spawn(single_encoding(), MemoryBroker::new(BodyEncoding::Single));
        assert!(matches!(
            client.connect("  ").await,
            Err(ClientError::Composite(CompositeError::Configuration(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn join_before_init_is_rejected() {
        let client = CompositeClient::spawn(single_encoding(), MemoryBroker::new(BodyEncoding::Single));
        assert!(matches!(
            client.join(None).await,
            Err(ClientError::Composite(CompositeError::Precondition(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_stays_disconnected() {
        let wrong = Credentials {
            login: "admin".into(),
            passcode: "admin".into(),
        };
        let broker = MemoryBroker::with_credentials(BodyEncoding::Single, wrong);
        let client = CompositeClient::spawn(single_encoding(), broker);
        client.connect("memory://composite").await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        let state = client.state().await.unwrap();
        assert_eq!(state.phase, Phase::Disconnected);
        assert_eq!(state.uuid, None);
    }

    #[derive(Default)]
    struct Recorded {
        events: Option<mpsc::UnboundedSender<BrokerEvent>>,
        subscriptions: Vec<(SubscriptionId, String)>,
        sends: Vec<String>,
    }

    /// Broker double that records sends and lets the test inject frames.
    #[derive(Clone, Default)]
    struct RecordingBroker(Arc<Mutex<Recorded>>);

    impl RecordingBroker {
        fn inject(&self, value: serde_json::Value) {
            let recorded = self.0.lock().unwrap();
            let (subscription, _) = recorded
                .subscriptions
                .iter()
                .find(|(_, dest)| dest == DEVICE_QUEUE)
                .cloned()
                .unwrap();
            let body = encode_body_as(&value, BodyEncoding::Single).unwrap();
            let frame = Frame::message(DEVICE_QUEUE, body);
            recorded
                .events
                .as_ref()
                .unwrap()
                .send(BrokerEvent::Message {
                    subscription,
                    frame,
                })
                .unwrap();
        }

        fn sends(&self) -> Vec<String> {
            self.0.lock().unwrap().sends.clone()
        }
    }

    impl Broker for RecordingBroker {
        fn connect(
            &mut self,
            _url: &str,
            _credentials: &Credentials,
            _heartbeat: Duration,
            events: mpsc::UnboundedSender<BrokerEvent>,
        ) -> Result<(), BrokerError> {
            events.send(BrokerEvent::Connected(Frame::connected())).unwrap();
            self.0.lock().unwrap().events = Some(events);
            Ok(())
        }

        fn subscribe(&mut self, id: SubscriptionId, destination: &str) -> Result<(), BrokerError> {
            self.0
                .lock()
                .unwrap()
                .subscriptions
                .push((id, destination.to_owned()));
            Ok(())
        }

        fn send(&mut self, destination: &str, _headers: &Headers, _body: &str) -> Result<(), BrokerError> {
            self.0.lock().unwrap().sends.push(destination.to_owned());
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn pings_run_until_disconnect() {
        let broker = RecordingBroker::default();
        let client = CompositeClient::spawn(single_encoding(), broker.clone());
        client.connect("memory://recording").await.unwrap();
        client.state().await.unwrap();

        time::sleep(Duration::from_millis(1_010)).await;
        let pings = broker
            .sends()
            .iter()
            .filter(|d| d.as_str() == PING_DESTINATION)
            .count();
        assert_eq!(pings, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_ping_interval_does_not_start_a_timer() {
        let (fired, mut ticks) = mpsc::unbounded_channel();
        let mut timers = Timers::new(fired);
        timers.start(TimerKind::Ping, TimerSchedule::Every(Duration::ZERO));
        assert!(!timers.is_current(TimerKind::Ping, 1));
        timers.start(TimerKind::Ping, TimerSchedule::Every(Duration::from_millis(250)));
        assert!(timers.is_current(TimerKind::Ping, 1));
        time::sleep(Duration::from_millis(260)).await;
        assert_eq!(ticks.try_recv().ok(), Some((TimerKind::Ping, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn client_with_zero_ping_interval_keeps_running() {
        let broker = RecordingBroker::default();
        let config = CoordinatorConfig {
            ping_interval: Duration::ZERO,
            ..single_encoding()
        };
        let client = CompositeClient::spawn(config, broker.clone());
        client.connect("memory://recording").await.unwrap();
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.state().await.unwrap().phase, Phase::Connected);
        assert!(!broker.sends().iter().any(|d| d == PING_DESTINATION));
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_sent_after_disconnect() {
        let broker = RecordingBroker::default();
        let client = CompositeClient::spawn(single_encoding(), broker.clone());
        client.connect("memory://recording").await.unwrap();
        assert_eq!(client.state().await.unwrap().phase, Phase::Connected);

        broker.inject(json!({"type": "init", "uuid": "A"}));
        broker.inject(json!({"type": "join", "id": "s1", "devices": [{"uuid": "A"}]}));
        assert_eq!(client.state().await.unwrap().session.as_deref(), Some("s1"));

        // The deferred devices request is still pending here.
        client.disconnect().await.unwrap();
        let sent = broker.sends();
        assert_eq!(sent.last().map(String::as_str), Some("/app/disconnect"));

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.sends(), sent);
        assert!(!sent.iter().any(|d| d == "/app/s1"));
    }
}
