use crate::config::ConnectionSettings;
use crate::config_sync::Publisher;
use crate::console::{ConsoleEvent, ConsoleSink};
use crate::models::TransportScheme;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_retry::strategy::ExponentialBackoff;

const WEBSOCKET_PATH: &str = "/mqtt";
const REQUEST_QUEUE_CAPACITY: usize = 10;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Please enter server address and port")]
    MissingAddress,
    #[error("Please enter client ID")]
    MissingClientId,
    #[error("Not connected to the broker")]
    NotConnected,
    #[error("MQTT client request failed: {0}")]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Receives every publish delivered by the broker, on the session worker.
pub trait InboundHandler: Send + Sync {
    fn handle(&self, topic: &str, payload: &[u8]);
}

/// Non-blocking client requests. Implemented for the rumqttc client; tests
/// substitute a recorder.
pub trait BrokerLink: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), SessionError>;
    fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError>;
    fn disconnect(&self) -> Result<(), SessionError>;
}

impl BrokerLink for AsyncClient {
    fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
        Ok(self.try_subscribe(topic, QoS::AtMostOnce)?)
    }

    fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError> {
        Ok(self.try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())?)
    }

    fn disconnect(&self) -> Result<(), SessionError> {
        Ok(self.try_disconnect()?)
    }
}

/// Automatic reconnect after a connection error. Zero retries means the
/// operator reconnects by hand.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub fn manual() -> Self {
        Self {
            max_retries: 0,
            interval_ms: 1000,
        }
    }

    /// Delays of interval, 2x, 4x ... capped at a minute.
    fn delays(&self) -> impl Iterator<Item = Duration> {
        // Base 2 starts at twice the factor; halve to start at the interval itself.
        ExponentialBackoff::from_millis(2)
            .factor(self.interval_ms.max(1))
            .max_delay(MAX_RETRY_DELAY * 2)
            .map(|delay| delay / 2)
            .take(self.max_retries)
    }
}

struct Session {
    state: SessionState,
    link: Option<Arc<dyn BrokerLink>>,
    subscriptions: BTreeSet<String>,
    /// Bumped on every connect/disconnect so a superseded worker can tell it is stale.
    generation: u64,
    worker: Option<JoinHandle<()>>,
}

/// Owns the single broker session: connection state, the subscription set
/// and the background worker that drives the rumqttc event loop.
pub struct SessionManager {
    session: Mutex<Session>,
    console: ConsoleSink,
    keep_alive: Duration,
    retry: RetryPolicy,
}

impl SessionManager {
    pub fn new(console: ConsoleSink, keep_alive: Duration, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(Session {
                state: SessionState::Disconnected,
                link: None,
                subscriptions: BTreeSet::new(),
                generation: 0,
                worker: None,
            }),
            console,
            keep_alive,
            retry,
        })
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.session.lock().subscriptions.iter().cloned().collect()
    }

    /// Starts connecting in the background. Returns once the request is
    /// under way; the outcome arrives as a connectivity event. Any existing
    /// session is torn down first. Must be called inside a tokio runtime.
    pub fn connect(
        self: &Arc<Self>,
        settings: &ConnectionSettings,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), SessionError> {
        let options = mqtt_options(settings, self.keep_alive)?;
        self.disconnect();

        info!(
            "Connecting to MQTT broker at {}{}:{} as '{}'...",
            settings.transport.prefix(),
            settings.host,
            settings.port,
            settings.client_id
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);
        let generation = self.attach(Arc::new(client));

        let worker = tokio::spawn(self.clone().run(generation, eventloop, handler));
        let mut session = self.session.lock();
        if session.generation == generation {
            session.worker = Some(worker);
        } else {
            worker.abort();
        }
        Ok(())
    }

    /// Installs a fresh link and moves to Connecting. Returns the new generation.
    fn attach(&self, link: Arc<dyn BrokerLink>) -> u64 {
        let mut session = self.session.lock();
        session.generation += 1;
        session.link = Some(link);
        session.state = SessionState::Connecting;
        if let Some(old) = session.worker.take() {
            old.abort();
        }
        session.generation
    }

    /// Stops the session. Safe to call in any state, any number of times;
    /// buffered telemetry and stored events are untouched.
    pub fn disconnect(&self) {
        let (link, previous) = {
            let mut session = self.session.lock();
            session.generation += 1;
            let previous = session.state;
            session.state = SessionState::Disconnected;
            (session.link.take(), previous)
        };

        if let Some(link) = link {
            if let Err(e) = link.disconnect() {
                debug!("Disconnect request not queued: {}", e);
            }
        }
        if previous != SessionState::Disconnected {
            info!("Disconnected from MQTT broker.");
            self.console.emit(ConsoleEvent::Connectivity {
                connected: false,
                detail: "Connection disconnected".to_string(),
            });
        }
    }

    /// Subscribes and remembers the topic for resubscription. Fails when not
    /// connected. A topic already in the set is a successful no-op.
    pub fn subscribe(&self, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }

        let link = {
            let session = self.session.lock();
            match (&session.state, &session.link) {
                (SessionState::Connected, Some(link)) => {
                    if session.subscriptions.contains(topic) {
                        return true;
                    }
                    link.clone()
                }
                _ => return false,
            }
        };

        match link.subscribe(topic) {
            Ok(()) => {
                let inserted = self.session.lock().subscriptions.insert(topic.to_string());
                if inserted {
                    info!("Subscribed to topic '{}'.", topic);
                    self.console.emit(ConsoleEvent::Subscribed {
                        topic: topic.to_string(),
                    });
                }
                true
            }
            Err(e) => {
                error!("Failed to subscribe to topic '{}': {}", topic, e);
                self.console.emit(ConsoleEvent::RequestFailed {
                    detail: format!("Failed to subscribe to {topic}: {e}"),
                });
                false
            }
        }
    }

    /// Queues a publish without waiting for the broker.
    pub fn publish(&self, topic: &str, payload: &str) -> bool {
        let link = {
            let session = self.session.lock();
            match (&session.state, &session.link) {
                (SessionState::Connected, Some(link)) => link.clone(),
                _ => {
                    debug!("Publish to '{}' dropped: {}", topic, SessionError::NotConnected);
                    return false;
                }
            }
        };

        match link.publish(topic, payload) {
            Ok(()) => {
                debug!("Message queued for '{}': {}", topic, payload);
                true
            }
            Err(e) => {
                error!("Failed to publish message to '{}': {}", topic, e);
                self.console.emit(ConsoleEvent::RequestFailed {
                    detail: format!("Failed to publish to {topic}: {e}"),
                });
                false
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.session.lock().generation == generation
    }

    /// Broker accepted the connection: mark Connected and replay every
    /// remembered subscription.
    fn on_connected(&self, generation: u64) {
        let (link, topics) = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.state = SessionState::Connected;
            let topics: Vec<String> = session.subscriptions.iter().cloned().collect();
            (session.link.clone(), topics)
        };

        info!("Connected to MQTT broker.");
        if let Some(link) = link {
            for topic in &topics {
                match link.subscribe(topic) {
                    Ok(()) => debug!("Resubscribed to '{}'.", topic),
                    Err(e) => {
                        warn!("Failed to resubscribe to '{}': {}", topic, e);
                        self.console.emit(ConsoleEvent::RequestFailed {
                            detail: format!("Failed to resubscribe to {topic}: {e}"),
                        });
                    }
                }
            }
        }

        self.console.emit(ConsoleEvent::Connectivity {
            connected: true,
            detail: "Connected successfully".to_string(),
        });
    }

    /// Connection attempt or live connection failed. With `keep_link` the
    /// client stays installed for a retry; otherwise the session is released.
    fn on_connection_lost(&self, generation: u64, detail: String, keep_link: bool) {
        {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.state = SessionState::Disconnected;
            if !keep_link {
                session.link = None;
                session.worker = None;
            }
        }
        self.console.emit(ConsoleEvent::Connectivity {
            connected: false,
            detail,
        });
    }

    fn on_retry(&self, generation: u64) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation {
            return false;
        }
        session.state = SessionState::Connecting;
        true
    }

    async fn run(self: Arc<Self>, generation: u64, mut eventloop: EventLoop, handler: Arc<dyn InboundHandler>) {
        let mut delays = self.retry.delays();

        loop {
            let polled = eventloop.poll().await;
            if !self.is_current(generation) {
                debug!("Session superseded; stopping worker.");
                break;
            }

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    delays = self.retry.delays();
                    self.on_connected(generation);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    handler.handle(&publish.topic, &publish.payload);
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack.return_codes.iter().any(|code| matches!(code, SubscribeReasonCode::Failure)) {
                        warn!("Broker rejected subscription (packet {}).", ack.pkid);
                        self.console.emit(ConsoleEvent::RequestFailed {
                            detail: "Broker rejected a subscription".to_string(),
                        });
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("Disconnect sent.");
                }
                Ok(event) => {
                    debug!("Unhandled event: {:?}", event);
                }
                Err(e) => {
                    let was_connected = self.state() == SessionState::Connected;
                    let detail = if was_connected {
                        format!("Connection disconnected: {e}")
                    } else {
                        format!("Connection failed: {e}")
                    };
                    error!("Error in MQTT event loop: {:?}", e);

                    match delays.next() {
                        Some(delay) => {
                            self.on_connection_lost(generation, detail, true);
                            warn!("Lost connection to MQTT broker. Retrying in {:?}...", delay);
                            sleep(delay).await;
                            if !self.on_retry(generation) {
                                break;
                            }
                        }
                        None => {
                            self.on_connection_lost(generation, detail, false);
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl Publisher for SessionManager {
    fn publish(&self, topic: &str, payload: &str) -> bool {
        SessionManager::publish(self, topic, payload)
    }
}

fn mqtt_options(settings: &ConnectionSettings, keep_alive: Duration) -> Result<MqttOptions, SessionError> {
    let host = settings.host.trim();
    if host.is_empty() || settings.port == 0 {
        return Err(SessionError::MissingAddress);
    }
    let client_id = settings.client_id.trim();
    if client_id.is_empty() {
        return Err(SessionError::MissingClientId);
    }

    let broker = if settings.transport.is_websocket() {
        format!("{}{}:{}{}", settings.transport.prefix(), host, settings.port, WEBSOCKET_PATH)
    } else {
        host.to_string()
    };

    let mut mqtt_options = MqttOptions::new(client_id, broker, settings.port);
    mqtt_options.set_keep_alive(keep_alive);
    mqtt_options.set_clean_session(true);

    if !settings.username.is_empty() && !settings.password.is_empty() {
        mqtt_options.set_credentials(&settings.username, &settings.password);
    }

    match settings.transport {
        TransportScheme::Plain => {}
        TransportScheme::Secure => {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }
        TransportScheme::WebSocket => {
            mqtt_options.set_transport(Transport::Ws);
        }
        TransportScheme::SecureWebSocket => {
            mqtt_options.set_transport(Transport::wss_with_default_config());
        }
    }

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_log::MessageLog;
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct RecordingLink {
        subscribed: Mutex<Vec<String>>,
        published: Mutex<Vec<(String, String)>>,
        disconnects: Mutex<usize>,
    }

    impl BrokerLink for RecordingLink {
        fn subscribe(&self, topic: &str) -> Result<(), SessionError> {
            self.subscribed.lock().push(topic.to_string());
            Ok(())
        }

        fn publish(&self, topic: &str, payload: &str) -> Result<(), SessionError> {
            self.published.lock().push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), SessionError> {
            *self.disconnects.lock() += 1;
            Ok(())
        }
    }

    fn manager() -> (Arc<SessionManager>, UnboundedReceiver<ConsoleEvent>) {
        let (sink, rx) = ConsoleSink::new(Arc::new(MessageLog::new()));
        (SessionManager::new(sink, Duration::from_secs(60), RetryPolicy::manual()), rx)
    }

    fn connect_fake(manager: &SessionManager) -> (Arc<RecordingLink>, u64) {
        let link = Arc::new(RecordingLink::default());
        let generation = manager.attach(link.clone());
        manager.on_connected(generation);
        (link, generation)
    }

    fn drain(rx: &mut UnboundedReceiver<ConsoleEvent>) -> Vec<ConsoleEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn requests_fail_while_disconnected() {
        let (manager, _rx) = manager();
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(!manager.subscribe("/ESP32/detection_data"));
        assert!(!manager.publish("/ESP32/config", "{}"));
        assert!(manager.subscriptions().is_empty());
    }

    #[test]
    fn requests_fail_while_connecting() {
        let (manager, _rx) = manager();
        let link = Arc::new(RecordingLink::default());
        manager.attach(link.clone());
        assert_eq!(manager.state(), SessionState::Connecting);
        assert!(!manager.subscribe("a"));
        assert!(!manager.publish("a", "b"));
        assert!(link.subscribed.lock().is_empty());
    }

    #[test]
    fn duplicate_subscribe_keeps_set_size() {
        let (manager, _rx) = manager();
        let (link, _) = connect_fake(&manager);
        assert!(manager.subscribe("/ESP32/detection_data"));
        assert!(manager.subscribe("/ESP32/detection_data"));
        assert!(manager.subscribe("/ESP32/config_update"));
        assert_eq!(manager.subscriptions().len(), 2);
        assert_eq!(link.subscribed.lock().len(), 2);
    }

    #[test]
    fn reconnect_replays_every_subscription() {
        let (manager, mut rx) = manager();
        let (_first, _) = connect_fake(&manager);
        manager.subscribe("/ESP32/detection_data");
        manager.subscribe("/ESP32/config_update");
        manager.subscribe("/ESP32/debug");

        manager.disconnect();
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert_eq!(manager.subscriptions().len(), 3);

        let (second, _) = connect_fake(&manager);
        assert_eq!(manager.state(), SessionState::Connected);
        let mut replayed = second.subscribed.lock().clone();
        replayed.sort();
        assert_eq!(
            replayed,
            vec!["/ESP32/config_update", "/ESP32/debug", "/ESP32/detection_data"]
        );

        let connectivity: Vec<bool> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ConsoleEvent::Connectivity { connected, .. } => Some(connected),
                _ => None,
            })
            .collect();
        assert_eq!(connectivity, vec![true, false, true]);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (manager, mut rx) = manager();
        let (link, _) = connect_fake(&manager);
        drain(&mut rx);

        manager.disconnect();
        manager.disconnect();
        manager.disconnect();

        assert_eq!(*link.disconnects.lock(), 1);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ConsoleEvent::Connectivity { connected: false, .. }));
    }

    #[test]
    fn stale_generation_is_ignored() {
        let (manager, _rx) = manager();
        let (_link, old_generation) = connect_fake(&manager);
        manager.disconnect();

        manager.on_connected(old_generation);
        assert_eq!(manager.state(), SessionState::Disconnected);
        manager.on_connection_lost(old_generation, "late failure".to_string(), false);
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[test]
    fn connection_loss_reports_detail_and_blocks_requests() {
        let (manager, mut rx) = manager();
        let (_link, generation) = connect_fake(&manager);
        manager.subscribe("/ESP32/detection_data");
        drain(&mut rx);

        manager.on_connection_lost(generation, "Connection disconnected: reset".to_string(), false);
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert!(!manager.publish("/ESP32/config", "{}"));
        assert_eq!(manager.subscriptions(), vec!["/ESP32/detection_data"]);
        assert_eq!(
            drain(&mut rx),
            vec![ConsoleEvent::Connectivity {
                connected: false,
                detail: "Connection disconnected: reset".to_string(),
            }]
        );
    }

    #[test]
    fn publish_goes_through_link_when_connected() {
        let (manager, _rx) = manager();
        let (link, _) = connect_fake(&manager);
        assert!(Publisher::publish(manager.as_ref(), "/ESP32/config", "{\"measurement_mode\":1}"));
        assert_eq!(
            link.published.lock().as_slice(),
            &[("/ESP32/config".to_string(), "{\"measurement_mode\":1}".to_string())]
        );
    }

    #[test]
    fn retry_delays_double_and_cap() {
        let policy = RetryPolicy {
            max_retries: 8,
            interval_ms: 1000,
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 8);
        assert_eq!(delays[0], Duration::from_millis(1000));
        assert_eq!(delays[1], Duration::from_millis(2000));
        assert_eq!(delays[2], Duration::from_millis(4000));
        assert_eq!(delays[7], MAX_RETRY_DELAY);
        assert_eq!(RetryPolicy::manual().delays().count(), 0);
    }

    #[test]
    fn odd_retry_interval_is_kept_exactly() {
        let policy = RetryPolicy {
            max_retries: 3,
            interval_ms: 1001,
        };
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1001),
                Duration::from_millis(2002),
                Duration::from_millis(4004)
            ]
        );
    }

    #[test]
    fn options_validate_required_fields() {
        let mut settings = ConnectionSettings::default();
        settings.host = "  ".to_string();
        assert!(matches!(
            mqtt_options(&settings, Duration::from_secs(60)),
            Err(SessionError::MissingAddress)
        ));

        let mut settings = ConnectionSettings::default();
        settings.client_id = String::new();
        assert!(matches!(
            mqtt_options(&settings, Duration::from_secs(60)),
            Err(SessionError::MissingClientId)
        ));
    }

    #[test]
    fn websocket_options_use_url_broker_address() {
        let settings = ConnectionSettings {
            transport: TransportScheme::WebSocket,
            host: "broker.local".to_string(),
            port: 8083,
            client_id: "console".to_string(),
            username: String::new(),
            password: String::new(),
        };
        let options = mqtt_options(&settings, Duration::from_secs(60)).unwrap();
        assert_eq!(options.broker_address(), ("ws://broker.local:8083/mqtt".to_string(), 8083));
    }

    #[tokio::test]
    async fn unreachable_broker_reports_failure_and_disconnects() {
        let (manager, mut rx) = manager();
        let settings = ConnectionSettings {
            transport: TransportScheme::Plain,
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: "thermal-test".to_string(),
            username: String::new(),
            password: String::new(),
        };

        struct Ignore;
        impl InboundHandler for Ignore {
            fn handle(&self, _topic: &str, _payload: &[u8]) {}
        }

        manager.connect(&settings, Arc::new(Ignore)).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ConsoleEvent::Connectivity { connected, detail } => {
                assert!(!connected);
                assert!(detail.starts_with("Connection failed"), "{detail}");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.state(), SessionState::Disconnected);
    }
}
