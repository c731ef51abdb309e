//! Configuration options.

use std::sync::Arc;

use calloop::LoopHandle;
use calloop::channel::{self, Event, Sender};
use configory::EventHandler;
use configory::docgen::Docgen;
use serde::Deserialize;
use tracing::{error, info};

use crate::State;

/// # geoclued-rs
///
/// ## Syntax
///
/// geoclued-rs's configuration file uses the TOML format. The format's
/// specification can be found at _https://toml.io/en/v1.0.0_.
///
/// ## Location
///
/// geoclued-rs doesn't create the configuration file for you, but it looks
/// for one at <br>
/// `${XDG_CONFIG_HOME:-$HOME/.config}/geoclued-rs/geoclued-rs.toml`.
///
/// ## Fields
#[derive(Docgen, Deserialize, Default, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// This section documents the `[wifi]` table.
    pub wifi: Wifi,
    /// This section documents the `[3g]` table.
    #[serde(rename = "3g")]
    pub three_g: ThreeG,
    /// This section documents the `[network-nmea]` table.
    pub network_nmea: NetworkNmea,
    /// This section documents the `[static-source]` table.
    pub static_source: StaticSourceConfig,
}

/// Wi-Fi based geolocation.
#[derive(Docgen, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct Wifi {
    /// URL used to resolve a position from visible Wi-Fi access points.
    pub locate_url: Arc<String>,
    /// URL used to submit observations back to the location service.
    ///
    /// An empty URL disables submission entirely.
    pub submit_url: Arc<String>,
    /// Submit Wi-Fi/cell observations to `submit_url`.
    pub submit_data: bool,
    /// Nickname attached to submissions via the `X-Nickname` header.
    ///
    /// Left empty, no nickname header is sent.
    pub submit_nick: Arc<String>,
}

impl Default for Wifi {
    fn default() -> Self {
        Self {
            locate_url: Arc::new("https://location.services.mozilla.com/v1/geolocate".into()),
            submit_url: Arc::new("https://location.services.mozilla.com/v1/geosubmit".into()),
            submit_data: false,
            submit_nick: Arc::new(String::new()),
        }
    }
}

/// 3GPP cell-tower based geolocation.
#[derive(Docgen, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct ThreeG {
    /// URL used to resolve a position from the visible cell tower.
    pub locate_url: Arc<String>,
    /// URL used to submit cell tower observations back to the location
    /// service.
    pub submit_url: Arc<String>,
    /// Minimum interval, in seconds, between two automatic refreshes of the
    /// cell-derived location while the source stays active.
    pub refresh_interval: u64,
}

impl Default for ThreeG {
    fn default() -> Self {
        Self {
            locate_url: Arc::new("https://location.services.mozilla.com/v1/geolocate".into()),
            submit_url: Arc::new("https://location.services.mozilla.com/v1/geosubmit".into()),
            refresh_interval: 25 * 60,
        }
    }
}

/// Network-attached NMEA GPS receiver discovery.
#[derive(Docgen, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkNmea {
    /// Enable mDNS discovery of `_nmea-0183._tcp` services on the local
    /// network.
    pub enabled: bool,
    /// Seconds a broken connection is kept on a cooldown list before it's
    /// retried again.
    pub unbreak_timeout: u64,
    /// Path to a local Unix domain socket streaming NMEA sentences.
    ///
    /// Inserted as a permanent, exact-accuracy service alongside whatever
    /// mDNS discovers. Empty disables it.
    pub nmea_socket: Arc<String>,
}

impl Default for NetworkNmea {
    fn default() -> Self {
        Self { enabled: true, unbreak_timeout: 5, nmea_socket: Arc::new(String::new()) }
    }
}

/// Statically configured fallback location.
#[derive(Docgen, Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct StaticSourceConfig {
    /// Path to the static location file.
    ///
    /// Each non-empty, non-comment line holds one value in order: latitude,
    /// longitude, altitude, accuracy. Lines starting with `#` are comments.
    pub file_path: Arc<String>,
    /// Round the static location down to city-level accuracy before
    /// reporting it.
    pub scramble_location: bool,
}

impl Default for StaticSourceConfig {
    fn default() -> Self {
        Self {
            file_path: Arc::new("/etc/geoclued-rs/geolocation".into()),
            scramble_location: false,
        }
    }
}

/// Event handler for configuration manager updates.
pub struct ConfigEventHandler {
    tx: Sender<Config>,
}

impl ConfigEventHandler {
    pub fn new(event_loop: &LoopHandle<'static, State>) -> Self {
        // Create calloop channel to apply config updates.
        let (tx, rx) = channel::channel();
        let _ = event_loop
            .insert_source(rx, |event, _, state| {
                if let Event::Msg(config) = event {
                    state.update_config(config);
                }
            })
            .inspect_err(|err| error!("Failed to insert config source: {err}"));

        Self { tx }
    }

    /// Reload the configuration file.
    fn reload_config(&self, config: &configory::Config) {
        info!("Reloading configuration file");

        // Parse config or fall back to the default.
        let parsed = config
            .get::<&str, Config>(&[])
            .inspect_err(|err| error!("Config error: {err}"))
            .ok()
            .flatten()
            .unwrap_or_default();

        // Update the config.
        if let Err(err) = self.tx.send(parsed) {
            error!("Failed to send on config channel: {err}");
        }
    }
}

impl EventHandler for ConfigEventHandler {
    type MessageData = ();

    fn file_changed(&self, config: &configory::Config) {
        self.reload_config(config);
    }

    fn ipc_changed(&self, config: &configory::Config) {
        self.reload_config(config);
    }

    fn file_error(&self, _config: &configory::Config, err: configory::Error) {
        error!("Configuration file error: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wifi_submit_disabled_without_url_opt_in() {
        let wifi = Wifi::default();
        assert!(!wifi.submit_data);
    }

    #[test]
    fn three_g_default_refresh_matches_geoclue_interval() {
        let three_g = ThreeG::default();
        assert_eq!(three_g.refresh_interval, 25 * 60);
    }
}
