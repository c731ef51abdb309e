use std::env;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use calloop::{EventLoop, LoopHandle};
use configory::{Manager as ConfigManager, Options as ConfigOptions};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{Config, ConfigEventHandler};
use crate::dbus::modem_manager::{self, ModemEvent};
use crate::error::Error;
use crate::location::{AccuracyLevel, LocationValue};
use crate::mozilla::Bss;
use crate::nmea::{MdnsDiscovery, NmeaDiscovery, NmeaMultiplexer, ServiceInfo, unix_socket_service};
use crate::source::SourceBase;
use crate::sources::threeg::ThreeGSource;
use crate::sources::wifi::{WifiProvider, WifiSource};
use crate::static_source::{StaticLocation, StaticSource, StaticSourceEvent};

mod config;
mod dbus;
mod error;
mod location;
mod mozilla;
mod nmea;
mod source;
mod sources;
mod static_source;
mod web_source;

/// How often a precise-enough, submission-enabled location is re-offered to
/// the location services as an observation.
const SUBMIT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let directives =
        env::var("RUST_LOG").unwrap_or_else(|_| "warn,geoclued_rs=info,configory=info".into());
    let env_filter = EnvFilter::builder().parse_lossy(directives);
    FmtSubscriber::builder().with_env_filter(env_filter).with_line_number(true).init();

    info!("Started geoclued-rs");

    if let Err(err) = run().await {
        error!("[CRITICAL] {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let mut event_loop: EventLoop<'static, State> = EventLoop::try_new()?;
    let mut state = State::new(&event_loop.handle()).await?;

    let (tokio_tx, mut tokio_rx) = mpsc::unbounded_channel::<TokioEvent>();
    spawn_background_tasks(&state, tokio_tx);

    let (calloop_tx, calloop_rx) = calloop::channel::channel();
    tokio::spawn(async move {
        while let Some(event) = tokio_rx.recv().await {
            if calloop_tx.send(event).is_err() {
                break;
            }
        }
    });
    event_loop.handle().insert_source(calloop_rx, |event, _, state| {
        if let calloop::channel::Event::Msg(event) = event {
            state.handle_tokio_event(event);
        }
    })?;

    loop {
        event_loop.dispatch(None, &mut state)?;
    }
}

/// Events bridging the tokio-driven sources into the calloop state machine.
enum TokioEvent {
    Modem(ModemEvent),
    Static(StaticSourceEvent),
    Nmea(LocationValue),
}

/// Placeholder [`WifiProvider`] until a real NetworkManager BSS scan is
/// wired in; always reports no visible access points.
///
/// Grounded in the same documented scope boundary as
/// [`crate::sources::wifi`]: scanning itself, not the aggregation this
/// daemon performs once scan results exist, is out of scope.
struct EmptyWifiProvider;

impl WifiProvider for EmptyWifiProvider {
    fn visible_bsses(&self) -> Vec<Bss> {
        Vec::new()
    }
}

/// No-op [`NmeaDiscovery`] used when `network-nmea.enabled` is `false`: the
/// multiplexer still runs, so a configured `nmea-socket` keeps working, but
/// nothing is ever discovered over mDNS.
struct NoopDiscovery;

impl NmeaDiscovery for NoopDiscovery {
    fn poll_added(&mut self) -> Vec<ServiceInfo> {
        Vec::new()
    }

    fn poll_removed(&mut self) -> Vec<String> {
        Vec::new()
    }
}

fn spawn_background_tasks(state: &State, tx: mpsc::UnboundedSender<TokioEvent>) {
    let modem_tx = tx.clone();
    tokio::spawn(async move {
        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(err) = modem_manager::modem_listen(inner_tx).await {
                warn!("Modem listener stopped: {err}");
            }
        });
        while let Some(event) = inner_rx.recv().await {
            if modem_tx.send(TokioEvent::Modem(event)).is_err() {
                break;
            }
        }
    });

    let three_g = Arc::clone(&state.three_g);
    tokio::spawn(async move { three_g.run_refresh_timer().await });

    let three_g_reachability = Arc::clone(&state.three_g);
    tokio::spawn(async move { three_g_reachability.run_reachability_watcher().await });
    let wifi_reachability = Arc::clone(&state.wifi);
    tokio::spawn(async move { wifi_reachability.run_reachability_watcher().await });

    if state.submit_enabled {
        let three_g_submit = Arc::clone(&state.three_g);
        let wifi_submit = Arc::clone(&state.wifi);
        let nickname = Arc::clone(&state.submit_nickname);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SUBMIT_INTERVAL);
            loop {
                interval.tick().await;
                wifi_submit.submit(&nickname).await;
                three_g_submit.submit(&nickname).await;
            }
        });
    }

    let static_source_path = state.static_source_path.clone();
    let static_tx = tx.clone();
    tokio::spawn(async move {
        let initial = StaticSource::read_initial(&static_source_path);
        let _ = static_tx.send(TokioEvent::Static(initial));

        match StaticSource::spawn(static_source_path) {
            Ok((watcher, mut events)) => {
                // Keep the watcher alive for the task's lifetime.
                let _watcher = watcher;
                while let Some(event) = events.recv().await {
                    if static_tx.send(TokioEvent::Static(event)).is_err() {
                        break;
                    }
                }
            },
            Err(err) => warn!("Failed to watch static location file: {err}"),
        }
    });

    let nmea_tx = tx.clone();
    let nmea_enabled = state.nmea_enabled;
    let nmea_socket = Arc::clone(&state.nmea_socket);
    let unbreak_timeout = state.nmea_unbreak_timeout;
    tokio::spawn(async move {
        let mut multiplexer = NmeaMultiplexer::new(unbreak_timeout);
        if !nmea_socket.is_empty() {
            multiplexer.add_service(unix_socket_service(&nmea_socket));
        }

        let (location_tx, mut location_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(location) = location_rx.recv().await {
                if nmea_tx.send(TokioEvent::Nmea(location)).is_err() {
                    break;
                }
            }
        });

        let discovery: Box<dyn NmeaDiscovery> = if nmea_enabled {
            match MdnsDiscovery::new() {
                Ok(discovery) => Box::new(discovery),
                Err(err) => {
                    warn!("Failed to start NMEA mDNS discovery: {err}");
                    Box::new(NoopDiscovery)
                },
            }
        } else {
            Box::new(NoopDiscovery)
        };

        multiplexer.run(discovery, location_tx).await;
    });
}

/// Application state.
struct State {
    three_g: Arc<ThreeGSource>,
    wifi: Arc<WifiSource>,
    modem_gps: Arc<StdMutex<SourceBase>>,
    network_nmea: Arc<StdMutex<SourceBase>>,
    static_base: Arc<StdMutex<SourceBase>>,
    static_source_path: String,
    static_scramble: bool,
    submit_enabled: bool,
    submit_nickname: Arc<String>,
    nmea_enabled: bool,
    nmea_socket: Arc<String>,
    nmea_unbreak_timeout: Duration,

    _config_manager: ConfigManager<ConfigEventHandler>,
}

impl State {
    async fn new(event_loop: &LoopHandle<'static, Self>) -> Result<Self, Error> {
        let config_options = ConfigOptions::new("geoclued-rs").notify(true);
        let config_handler = ConfigEventHandler::new(event_loop);
        let config_manager = ConfigManager::with_options(&config_options, config_handler)?;
        let config = config_manager
            .get::<&str, Config>(&[])
            .inspect_err(|err| error!("Config error: {err}"))
            .ok()
            .flatten()
            .unwrap_or_default();

        let client = reqwest::Client::new();
        let three_g = Arc::new(ThreeGSource::new(
            client.clone(),
            Arc::clone(&config.three_g.locate_url),
            Arc::clone(&config.three_g.submit_url),
            Duration::from_secs(config.three_g.refresh_interval),
        ));
        three_g.activate().await;
        // No connectivity monitor is wired up; until one exists, the web
        // sources are told the network is always fully reachable.
        three_g.set_full_connectivity();

        let wifi = Arc::new(WifiSource::new(
            client,
            Arc::clone(&config.wifi.locate_url),
            Arc::clone(&config.wifi.submit_url),
            Arc::new(EmptyWifiProvider),
        ));
        wifi.activate().await;
        wifi.set_full_connectivity();

        let modem_gps = Arc::new(StdMutex::new(SourceBase::new()));
        modem_gps.lock().unwrap().subscribe_location(|location| {
            info!("Modem GPS location: {:.5},{:.5}", location.latitude, location.longitude);
        });

        let network_nmea = Arc::new(StdMutex::new(SourceBase::new()));
        network_nmea.lock().unwrap().subscribe_location(|location| {
            info!("Network NMEA location: {:.5},{:.5}", location.latitude, location.longitude);
        });

        let static_base = Arc::new(StdMutex::new(SourceBase::new()));
        static_base.lock().unwrap().subscribe_location(|location| {
            info!("Static location updated: {:.5},{:.5}", location.latitude, location.longitude);
        });

        Ok(Self {
            three_g,
            wifi,
            modem_gps,
            network_nmea,
            static_base,
            static_source_path: config.static_source.file_path.to_string(),
            static_scramble: config.static_source.scramble_location,
            submit_enabled: config.wifi.submit_data,
            submit_nickname: Arc::clone(&config.wifi.submit_nick),
            nmea_enabled: config.network_nmea.enabled,
            nmea_socket: Arc::clone(&config.network_nmea.nmea_socket),
            nmea_unbreak_timeout: Duration::from_secs(config.network_nmea.unbreak_timeout),
            _config_manager: config_manager,
        })
    }

    fn update_config(&mut self, config: Config) {
        self.static_source_path = config.static_source.file_path.to_string();
        self.static_scramble = config.static_source.scramble_location;
        self.submit_enabled = config.wifi.submit_data;
        self.submit_nickname = Arc::clone(&config.wifi.submit_nick);
        info!("Applied updated configuration");
    }

    fn handle_tokio_event(&mut self, event: TokioEvent) {
        match event {
            TokioEvent::Modem(ModemEvent::Gps(location)) => {
                let mut base = self.modem_gps.lock().unwrap();
                base.set_available_accuracy_level(AccuracyLevel::Exact);
                base.set_location(location);
            },
            TokioEvent::Modem(ModemEvent::Tower(tower)) => {
                let three_g = Arc::clone(&self.three_g);
                tokio::spawn(async move { three_g.set_tower(Some(tower)).await });
            },
            TokioEvent::Modem(ModemEvent::Unavailable) => {
                let three_g = Arc::clone(&self.three_g);
                tokio::spawn(async move { three_g.set_tower(None).await });
            },
            TokioEvent::Static(StaticSourceEvent::Updated(location)) => {
                let mut base = self.static_base.lock().unwrap();
                match location.to_location_value() {
                    Some(value) => {
                        base.set_available_accuracy_level(StaticLocation::available_accuracy_level(
                            self.static_scramble,
                        ));
                        base.set_location(value);
                    },
                    None => warn!("Static location file has out-of-range coordinates"),
                }
            },
            TokioEvent::Static(StaticSourceEvent::Cleared) => {
                let mut base = self.static_base.lock().unwrap();
                base.set_available_accuracy_level(AccuracyLevel::None);
                base.clear_location();
            },
            TokioEvent::Nmea(location) => {
                let mut base = self.network_nmea.lock().unwrap();
                base.set_available_accuracy_level(AccuracyLevel::Exact);
                base.set_location(location);
            },
        }
    }
}
