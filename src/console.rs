//! Operator console.
//!
//! The core never prints or blocks on the operator: everything it wants to
//! show goes through [`ConsoleSink`], which records a line in the capped
//! [`MessageLog`] and forwards the event over a channel. [`Console`] is the
//! consuming end; it reads commands from stdin and turns them into session,
//! config and store calls.

use crate::config::{Config, ConnectionSettings};
use crate::config_sync::{ConfigField, ConfigSync};
use crate::db::EventStore;
use crate::message_log::{LogCategory, MessageLog};
use crate::models::{
    DeviceConfig, FireEvent, MeasurementMode, Metric, TelemetryReading, TransportScheme, THRESHOLD_COUNT,
};
use crate::mqtt_service::SessionManager;
use crate::router::MessageRouter;
use crate::telemetry::TelemetryBuffers;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Everything the core reports to the console.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    Connectivity { connected: bool, detail: String },
    Subscribed { topic: String },
    /// A subscribe/publish the client could not queue, or a broker rejection.
    RequestFailed { detail: String },
    /// Message on a topic the router does not handle, passed through untouched.
    Received { topic: String, payload: String },
    Sent { topic: String, payload: String },
    ConfigSent { topic: String, payload: String },
    ConfigApplied(DeviceConfig),
    Detection {
        readings: Vec<TelemetryReading>,
        event: Option<FireEvent>,
    },
    Diagnostic(String),
    StoreFault(String),
}

impl ConsoleEvent {
    fn log_line(&self) -> (LogCategory, &'static str, String) {
        match self {
            Self::Connectivity { connected, detail } => {
                let color = if *connected { "green" } else { "red" };
                (LogCategory::System, color, detail.clone())
            }
            Self::Subscribed { topic } => {
                (LogCategory::System, "blue", format!("Subscribed to topic: {topic}"))
            }
            Self::RequestFailed { detail } => (LogCategory::Error, "red", detail.clone()),
            Self::Received { topic, payload } => (
                LogCategory::Received,
                LogCategory::Received.color(),
                format!("Topic: {topic}\nContent: {payload}"),
            ),
            Self::Sent { topic, payload } => (
                LogCategory::Sent,
                LogCategory::Sent.color(),
                format!("Topic: {topic}\nContent: {payload}"),
            ),
            Self::ConfigSent { topic, payload } => (
                LogCategory::ConfigSent,
                LogCategory::ConfigSent.color(),
                format!("Topic: {topic}\nContent: {payload}"),
            ),
            Self::ConfigApplied(config) => (
                LogCategory::ConfigUpdate,
                LogCategory::ConfigUpdate.color(),
                format!("Device configuration synced: {}", describe_config(config)),
            ),
            Self::Detection { readings, event } => {
                let mut line = format!("Temperature data updated ({} readings)", readings.len());
                if let Some(event) = event {
                    line.push_str(&format!(
                        ", fire event #{} recorded (fire detected: {})",
                        event.id, event.fire_detected
                    ));
                }
                (LogCategory::DetectionData, LogCategory::DetectionData.color(), line)
            }
            Self::Diagnostic(detail) => (LogCategory::Error, "red", detail.clone()),
            Self::StoreFault(detail) => {
                (LogCategory::Error, "red", format!("Event store fault: {detail}"))
            }
        }
    }
}

/// Producer side of the console channel. Cheap to clone; handed to every
/// component that reports to the operator.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    tx: mpsc::UnboundedSender<ConsoleEvent>,
    log: Arc<MessageLog>,
}

impl ConsoleSink {
    pub fn new(log: Arc<MessageLog>) -> (Self, mpsc::UnboundedReceiver<ConsoleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, log }, rx)
    }

    pub fn emit(&self, event: ConsoleEvent) {
        let (category, color, line) = event.log_line();
        self.log.push_colored(category, color, line);
        if self.tx.send(event).is_err() {
            debug!("Console receiver dropped; event kept in message log only.");
        }
    }

    pub fn log(&self) -> &Arc<MessageLog> {
        &self.log
    }
}

fn describe_config(config: &DeviceConfig) -> String {
    let thresholds: Vec<String> = config.thresholds.iter().map(|t| format!("{t}")).collect();
    format!("mode {}, thresholds [{}]", config.mode, thresholds.join(", "))
}

fn describe_temp(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}

/// Broker parameters typed on the `connect` line. Anything left out keeps
/// its current value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectArgs {
    pub transport: Option<TransportScheme>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub client_id: Option<String>,
    pub credentials: Option<(String, String)>,
}

impl ConnectArgs {
    pub fn apply(&self, current: &ConnectionSettings) -> ConnectionSettings {
        let mut settings = current.clone();
        if let Some(transport) = self.transport {
            settings.transport = transport;
        }
        if let Some(host) = &self.host {
            settings.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if let Some(client_id) = &self.client_id {
            settings.client_id = client_id.clone();
        }
        if let Some((username, password)) = &self.credentials {
            settings.username = username.clone();
            settings.password = password.clone();
        }
        settings
    }
}

const CONNECT_USAGE: &str = "usage: connect [scheme://host[:port]] [client_id] [username password]";

/// Splits `mqtts://broker.local:8883` (scheme and port optional, any path
/// after the authority ignored).
fn parse_broker(url: &str) -> Result<(Option<TransportScheme>, String, Option<u16>), String> {
    let (transport, rest) = match TransportScheme::ALL
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme.prefix()).map(|rest| (*scheme, rest)))
    {
        Some((scheme, rest)) => (Some(scheme), rest),
        None if url.contains("://") => {
            return Err(format!(
                "unsupported transport in '{url}' (expected mqtt://, mqtts://, ws:// or wss://)"
            ))
        }
        None => (None, url),
    };

    let authority = rest.split_once('/').map_or(rest, |(authority, _)| authority);
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| format!("invalid port '{port}'"))?;
            (host, Some(port))
        }
        None => (authority, None),
    };
    if host.is_empty() {
        return Err("Please enter broker address".to_string());
    }
    Ok((transport, host.to_string(), port))
}

fn parse_connect<'a>(mut args: impl Iterator<Item = &'a str>) -> Result<ConnectArgs, String> {
    let mut parsed = ConnectArgs::default();
    if let Some(url) = args.next() {
        let (transport, host, port) = parse_broker(url)?;
        parsed.transport = transport;
        parsed.host = Some(host);
        parsed.port = port;
    }
    parsed.client_id = args.next().map(str::to_string);
    parsed.credentials = match (args.next(), args.next()) {
        (None, _) => None,
        (Some(username), Some(password)) => Some((username.to_string(), password.to_string())),
        (Some(_), None) => return Err(CONNECT_USAGE.to_string()),
    };
    if args.next().is_some() {
        return Err(CONNECT_USAGE.to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Connect(ConnectArgs),
    Disconnect,
    Status,
    Subscribe(String),
    Publish { topic: String, payload: String },
    Mode(MeasurementMode),
    Threshold { number: usize, value: f64 },
    ShowConfig,
    Events(Option<bool>),
    ClearEvents,
    Export { path: String, filter: Option<bool> },
    Log(usize),
    Series(Metric),
    Help,
    Quit,
}

const HELP: &str = "\
commands:
  connect [scheme://host[:port]] [client_id] [username password]
                                 connect, keeping saved values for omitted fields
  disconnect | status
  sub <topic>                    subscribe
  pub <topic> <text>             publish a message
  mode <1-4>                     set measurement mode
  threshold <1-5> <value>        set a threshold
  config                         show device configuration
  events [all|fire|clear]        list fire events
  clear-events                   delete all fire events
  export <path> [all|fire|clear] write events as JSON
  log [n]                        show the last n notices
  series <min|max|center>        show a temperature series
  quit";

fn parse_filter(word: Option<&str>) -> Result<Option<bool>, String> {
    match word {
        None | Some("all") => Ok(None),
        Some("fire") => Ok(Some(true)),
        Some("clear") => Ok(Some(false)),
        Some(other) => Err(format!("unknown filter '{other}' (expected all, fire or clear)")),
    }
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();

    match head {
        "connect" => parse_connect(args).map(Command::Connect),
        "disconnect" => Ok(Command::Disconnect),
        "status" => Ok(Command::Status),
        "sub" | "subscribe" => match args.next() {
            Some(topic) => Ok(Command::Subscribe(topic.to_string())),
            None => Err("Please enter subscription topic".to_string()),
        },
        "pub" | "publish" => {
            let (topic, payload) = rest
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: pub <topic> <text>".to_string())?;
            let payload = payload.trim();
            if payload.is_empty() {
                return Err("Please enter message content".to_string());
            }
            Ok(Command::Publish {
                topic: topic.to_string(),
                payload: payload.to_string(),
            })
        }
        "mode" => {
            let wire: i64 = args
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| "usage: mode <1-4>".to_string())?;
            MeasurementMode::from_wire(wire)
                .map(Command::Mode)
                .ok_or_else(|| format!("mode must be between 1 and 4, got {wire}"))
        }
        "threshold" => {
            let number: usize = args
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| "usage: threshold <1-5> <value>".to_string())?;
            let value: f64 = args
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| "usage: threshold <1-5> <value>".to_string())?;
            if !(1..=THRESHOLD_COUNT).contains(&number) {
                return Err(format!("threshold must be between 1 and {THRESHOLD_COUNT}"));
            }
            Ok(Command::Threshold { number, value })
        }
        "config" => Ok(Command::ShowConfig),
        "events" => Ok(Command::Events(parse_filter(args.next())?)),
        "clear-events" => Ok(Command::ClearEvents),
        "export" => {
            let path = args.next().ok_or_else(|| "usage: export <path> [all|fire|clear]".to_string())?;
            Ok(Command::Export {
                path: path.to_string(),
                filter: parse_filter(args.next())?,
            })
        }
        "log" => {
            let n = match args.next() {
                Some(v) => v.parse().map_err(|_| format!("invalid count '{v}'"))?,
                None => 20,
            };
            Ok(Command::Log(n))
        }
        "series" => args
            .next()
            .and_then(Metric::parse)
            .map(Command::Series)
            .ok_or_else(|| "usage: series <min|max|center>".to_string()),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command '{other}' (try 'help')")),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Console {
    pub config: Arc<Config>,
    /// Parameters of the latest connect; saved once the broker accepts them.
    pub settings: Mutex<ConnectionSettings>,
    pub session: Arc<SessionManager>,
    pub sync: Arc<ConfigSync>,
    pub router: Arc<MessageRouter>,
    pub store: Arc<EventStore>,
    pub buffers: Arc<TelemetryBuffers>,
    pub sink: ConsoleSink,
}

impl Console {
    /// Connects with the saved settings when auto-connect is enabled;
    /// otherwise the session stays idle until the operator's `connect`.
    pub fn start(&self) {
        if !self.config.auto_connect {
            info!("Waiting for operator to connect.");
            return;
        }
        let settings = self.settings.lock().clone();
        if let Err(e) = self.session.connect(&settings, self.router.clone()) {
            error!("Cannot connect with saved settings: {}", e);
        }
    }

    /// Runs until `quit` or until the event channel closes. Once stdin hits
    /// EOF the console keeps draining events so the process can run headless.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ConsoleEvent>) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        println!("{HELP}");

        loop {
            tokio::select! {
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if self.execute(&line) == Flow::Quit {
                            break;
                        }
                    }
                    Ok(None) => {
                        info!("stdin closed; console continues without operator input.");
                        stdin_open = false;
                    }
                    Err(e) => {
                        error!("Failed to read operator input: {:?}", e);
                        stdin_open = false;
                    }
                },
                event = events.recv() => match event {
                    Some(event) => self.on_event(event),
                    None => break,
                },
            }
        }
    }

    fn on_event(&self, event: ConsoleEvent) {
        let (category, _, line) = event.log_line();
        println!("[{}] {}", category.label(), line);

        if let ConsoleEvent::Connectivity { connected: true, .. } = event {
            let settings = self.settings.lock().clone();
            if let Err(e) = settings.save(&self.config.settings_path) {
                warn!("Failed to save connection settings: {}", e);
            }
            for topic in self.config.topics.defaults() {
                self.session.subscribe(topic);
            }
        }
    }

    fn execute(&self, line: &str) -> Flow {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                return Flow::Continue;
            }
        };

        match command {
            Command::Connect(args) => {
                let settings = args.apply(&self.settings.lock());
                match self.session.connect(&settings, self.router.clone()) {
                    Ok(()) => *self.settings.lock() = settings,
                    Err(e) => println!("{e}"),
                }
            }
            Command::Disconnect => self.session.disconnect(),
            Command::Status => {
                let settings = self.settings.lock().clone();
                println!(
                    "session: {:?} ({}{}:{} as {})",
                    self.session.state(),
                    settings.transport.prefix(),
                    settings.host,
                    settings.port,
                    settings.client_id
                );
                println!("subscriptions: {:?}", self.session.subscriptions());
                let fire = match self.router.fire_state() {
                    Some(true) => "FIRE",
                    Some(false) => "Normal",
                    None => "unknown",
                };
                println!("fire state: {fire}");
                match self.store.count() {
                    Ok(count) => println!("stored events: {count}"),
                    Err(e) => self.sink.emit(ConsoleEvent::StoreFault(e.to_string())),
                }
                let last = self.router.last_seen();
                println!(
                    "last temperatures: min {} / max {} / center {}",
                    describe_temp(last.min),
                    describe_temp(last.max),
                    describe_temp(last.center)
                );
            }
            Command::Subscribe(topic) => {
                if !self.session.subscribe(&topic) {
                    println!("Subscription failed, please check connection status");
                }
            }
            Command::Publish { topic, payload } => {
                if !self.session.is_connected() {
                    println!("Please connect to MQTT broker first");
                } else if self.session.publish(&topic, &payload) {
                    self.sink.emit(ConsoleEvent::Sent { topic, payload });
                } else {
                    println!("Send failed, please check connection status");
                }
            }
            Command::Mode(mode) => self.edit(ConfigField::Mode(mode)),
            Command::Threshold { number, value } => self.edit(ConfigField::Threshold { number, value }),
            Command::ShowConfig => println!("{}", describe_config(&self.sync.current())),
            Command::Events(filter) => match self.store.query(filter) {
                Ok(events) => {
                    println!("ID | Timestamp | Min | Max | Center | Fire | Mode");
                    for event in events {
                        println!(
                            "{} | {} | {} | {} | {} | {} | {}",
                            event.id,
                            event.timestamp,
                            describe_temp(event.min_temp),
                            describe_temp(event.max_temp),
                            describe_temp(event.center_temp),
                            if event.fire_detected { "Yes" } else { "No" },
                            event.mode
                        );
                    }
                }
                Err(e) => self.sink.emit(ConsoleEvent::StoreFault(e.to_string())),
            },
            Command::ClearEvents => match self.store.clear() {
                Ok(removed) => println!("Removed {removed} events"),
                Err(e) => self.sink.emit(ConsoleEvent::StoreFault(e.to_string())),
            },
            Command::Export { path, filter } => match self.store.export_json(&path, filter) {
                Ok(0) => println!("No data to export."),
                Ok(count) => println!("Exported {count} events to {path}"),
                Err(e) => self.sink.emit(ConsoleEvent::StoreFault(e.to_string())),
            },
            Command::Log(n) => {
                for entry in self.sink.log().tail(n) {
                    println!("{entry}");
                }
            }
            Command::Series(metric) => {
                let samples = self.buffers.get(metric).snapshot();
                println!("{} series: {} samples", metric.label(), samples.len());
                for (at, value) in samples.iter().rev().take(10).rev() {
                    println!("  {} {value:.1}", at.unix_timestamp());
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return Flow::Quit,
        }

        Flow::Continue
    }

    fn edit(&self, field: ConfigField) {
        match self.sync.edit(field) {
            Ok(true) => {}
            Ok(false) => println!("Configuration changed locally; not connected, nothing was sent."),
            Err(e) => println!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topics;
    use crate::mqtt_service::{RetryPolicy, SessionState};
    use std::time::Duration;
    use tempfile::TempDir;

    fn console(dir: &TempDir) -> Console {
        let config = Arc::new(Config {
            db_path: dir.path().join("fire_records.db"),
            settings_path: dir.path().join("config.json"),
            topics: Topics::default(),
            mqtt_keep_alive_secs: 60,
            mqtt_max_retries: 0,
            mqtt_retry_interval_ms: 1000,
            auto_connect: false,
        });
        let (sink, _rx) = ConsoleSink::new(Arc::new(MessageLog::new()));
        let session = SessionManager::new(sink.clone(), Duration::from_secs(60), RetryPolicy::manual());
        let sync = Arc::new(ConfigSync::new(session.clone(), config.topics.config.clone(), sink.clone()));
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let buffers = Arc::new(TelemetryBuffers::new());
        let router = Arc::new(MessageRouter::new(
            config.topics.clone(),
            buffers.clone(),
            store.clone(),
            sync.clone(),
            sink.clone(),
        ));
        Console {
            config,
            settings: Mutex::new(ConnectionSettings::default()),
            session,
            sync,
            router,
            store,
            buffers,
            sink,
        }
    }

    #[test]
    fn bare_connect_keeps_saved_settings() {
        assert_eq!(parse_command("connect").unwrap(), Command::Connect(ConnectArgs::default()));
        let saved = ConnectionSettings::default();
        assert_eq!(ConnectArgs::default().apply(&saved), saved);
    }

    #[test]
    fn connect_parses_broker_client_and_credentials() {
        let Command::Connect(args) =
            parse_command("connect wss://broker.local:8884/mqtt console-7 admin s3cret").unwrap()
        else {
            panic!("expected connect");
        };
        assert_eq!(args.transport, Some(TransportScheme::SecureWebSocket));
        assert_eq!(args.host.as_deref(), Some("broker.local"));
        assert_eq!(args.port, Some(8884));
        assert_eq!(args.client_id.as_deref(), Some("console-7"));
        assert_eq!(args.credentials, Some(("admin".to_string(), "s3cret".to_string())));

        let settings = args.apply(&ConnectionSettings::default());
        assert_eq!(settings.transport, TransportScheme::SecureWebSocket);
        assert_eq!(settings.host, "broker.local");
        assert_eq!(settings.port, 8884);
        assert_eq!(settings.username, "admin");
    }

    #[test]
    fn connect_without_scheme_or_port_keeps_those_fields() {
        let saved = ConnectionSettings {
            transport: TransportScheme::Secure,
            port: 8883,
            ..ConnectionSettings::default()
        };
        let Command::Connect(args) = parse_command("connect 192.168.1.20").unwrap() else {
            panic!("expected connect");
        };
        let settings = args.apply(&saved);
        assert_eq!(settings.host, "192.168.1.20");
        assert_eq!(settings.transport, TransportScheme::Secure);
        assert_eq!(settings.port, 8883);
        assert_eq!(settings.client_id, saved.client_id);
    }

    #[test]
    fn connect_rejects_malformed_arguments() {
        assert!(parse_command("connect tcp://broker:1883").is_err());
        assert!(parse_command("connect mqtt://broker:port").is_err());
        assert!(parse_command("connect mqtt://broker:0").is_err());
        assert!(parse_command("connect mqtt://:1883").is_err());
        assert!(parse_command("connect mqtt://broker client admin").is_err());
        assert!(parse_command("connect mqtt://broker client admin pw extra").is_err());
    }

    #[tokio::test]
    async fn accepted_connect_updates_settings_and_saves_them_once_connected() {
        let dir = TempDir::new().unwrap();
        let console = console(&dir);

        console.execute("connect mqtt://127.0.0.1:1 bench-console");
        {
            let settings = console.settings.lock();
            assert_eq!(settings.host, "127.0.0.1");
            assert_eq!(settings.port, 1);
            assert_eq!(settings.client_id, "bench-console");
        }
        assert!(!console.config.settings_path.exists());

        console.on_event(ConsoleEvent::Connectivity {
            connected: true,
            detail: "Connected to MQTT broker".to_string(),
        });
        let saved = ConnectionSettings::load(&console.config.settings_path).unwrap();
        assert_eq!(saved.host, "127.0.0.1");
        assert_eq!(saved.client_id, "bench-console");
        console.session.disconnect();
    }

    #[test]
    fn startup_waits_for_operator_by_default() {
        let dir = TempDir::new().unwrap();
        let console = console(&dir);
        console.start();
        assert_eq!(console.session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn startup_connects_when_auto_connect_is_enabled() {
        let dir = TempDir::new().unwrap();
        let mut console = console(&dir);
        console.config = Arc::new(Config {
            auto_connect: true,
            ..(*console.config).clone()
        });
        console.settings.lock().host = "127.0.0.1".to_string();
        console.settings.lock().port = 1;

        console.start();
        assert_ne!(console.session.state(), SessionState::Disconnected);
        console.session.disconnect();
    }

    #[test]
    fn rejected_connect_leaves_settings_alone() {
        let dir = TempDir::new().unwrap();
        let console = console(&dir);
        console.settings.lock().client_id = String::new();
        let before = console.settings.lock().clone();

        console.execute("connect mqtt://broker.local:1884");
        assert_eq!(*console.settings.lock(), before);
        assert_eq!(console.session.state(), SessionState::Disconnected);
    }

    #[test]
    fn mode_command_rejects_extreme_values() {
        assert!(parse_command("mode -9223372036854775808").is_err());
        assert!(parse_command("mode 9223372036854775807").is_err());
    }

    #[test]
    fn parses_publish_with_spaces_in_payload() {
        let command = parse_command("pub /ESP32/test hello there  world").unwrap();
        assert_eq!(
            command,
            Command::Publish {
                topic: "/ESP32/test".to_string(),
                payload: "hello there  world".to_string(),
            }
        );
        assert!(parse_command("pub /ESP32/test").is_err());
    }

    #[test]
    fn mode_command_is_one_based() {
        assert_eq!(parse_command("mode 1").unwrap(), Command::Mode(MeasurementMode::Threshold));
        assert_eq!(parse_command("mode 4").unwrap(), Command::Mode(MeasurementMode::Comprehensive));
        assert!(parse_command("mode 5").is_err());
        assert!(parse_command("mode 0").is_err());
    }

    #[test]
    fn threshold_command_validates_number() {
        assert_eq!(
            parse_command("threshold 2 0.75").unwrap(),
            Command::Threshold { number: 2, value: 0.75 }
        );
        assert!(parse_command("threshold 6 1.0").is_err());
        assert!(parse_command("threshold 1 hot").is_err());
    }

    #[test]
    fn event_filters() {
        assert_eq!(parse_command("events").unwrap(), Command::Events(None));
        assert_eq!(parse_command("events fire").unwrap(), Command::Events(Some(true)));
        assert_eq!(parse_command("events clear").unwrap(), Command::Events(Some(false)));
        assert!(parse_command("events maybe").is_err());
        assert_eq!(
            parse_command("export out.json fire").unwrap(),
            Command::Export {
                path: "out.json".to_string(),
                filter: Some(true)
            }
        );
    }

    #[test]
    fn sink_logs_and_forwards() {
        let log = Arc::new(MessageLog::new());
        let (sink, mut rx) = ConsoleSink::new(log.clone());
        sink.emit(ConsoleEvent::Connectivity {
            connected: false,
            detail: "Connection disconnected".to_string(),
        });

        assert_eq!(log.len(), 1);
        assert_eq!(log.snapshot()[0].color, "red");
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConsoleEvent::Connectivity { connected: false, .. }
        ));
    }

    #[test]
    fn sink_survives_dropped_receiver() {
        let log = Arc::new(MessageLog::new());
        let (sink, rx) = ConsoleSink::new(log.clone());
        drop(rx);
        sink.emit(ConsoleEvent::Diagnostic("bad payload".to_string()));
        assert_eq!(log.len(), 1);
    }
}
