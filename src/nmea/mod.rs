//! Network NMEA-0183 GPS receiver multiplexing.
//!
//! Grounded in `gclue-nmea-source.c`: services are discovered via mDNS
//! (`_nmea-0183._tcp`, replacing the original's Avahi D-Bus binding with the
//! `mdns-sd` crate), kept in two ordered lists (`try_services`,
//! `broken_services`), and the multiplexer maintains at most one active
//! connection at a time to the best-ranked service in `try_services`. A
//! service that drops its connection moves to `broken_services` and is only
//! retried after `unbreak_time` seconds once every `try_services` entry has
//! also failed. A statically configured Unix domain socket is treated as just
//! another service: a permanent, exact-accuracy one that mDNS never removes.

pub mod parser;

use std::time::{Duration, Instant};

use indexmap::IndexMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::location::{AccuracyLevel, LocationValue};
use parser::{Gga, Rmc, Sentence};

const NMEA_SERVICE_TYPE: &str = "_nmea-0183._tcp.local.";
const DEFAULT_UNBREAK_TIME: Duration = Duration::from_secs(5);
/// How often the multiplexer's driving loop checks for new/removed services
/// while no reconnection is due.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Where a discovered NMEA service can be reached.
#[derive(Clone, Debug, PartialEq)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix { path: String },
}

/// A discovered NMEA network service.
#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub identifier: String,
    pub endpoint: Endpoint,
    pub accuracy: AccuracyLevel,
    pub added_at: Instant,
}

/// Build the permanent, exact-accuracy service entry for a configured
/// `network-nmea.nmea-socket` Unix domain socket.
pub fn unix_socket_service(path: &str) -> ServiceInfo {
    ServiceInfo {
        identifier: format!("unix:{path}"),
        endpoint: Endpoint::Unix { path: path.to_string() },
        accuracy: AccuracyLevel::Exact,
        added_at: Instant::now(),
    }
}

/// Abstraction over mDNS browsing, so the multiplexer's service-list logic
/// can be tested without opening real sockets or multicast groups.
pub trait NmeaDiscovery: Send {
    fn poll_added(&mut self) -> Vec<ServiceInfo>;
    fn poll_removed(&mut self) -> Vec<String>;
}

/// Real mDNS-backed discovery using `mdns-sd`'s `_nmea-0183._tcp` browser.
pub struct MdnsDiscovery {
    receiver: mdns_sd::Receiver<mdns_sd::ServiceEvent>,
    _daemon: mdns_sd::ServiceDaemon,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self, mdns_sd::Error> {
        let daemon = mdns_sd::ServiceDaemon::new()?;
        let receiver = daemon.browse(NMEA_SERVICE_TYPE)?;
        Ok(Self { receiver, _daemon: daemon })
    }

    fn accuracy_from_txt(info: &mdns_sd::ServiceInfo) -> AccuracyLevel {
        match info.get_property_val_str("accuracy") {
            Some("city") => AccuracyLevel::City,
            Some("street") => AccuracyLevel::Street,
            Some("neighborhood") => AccuracyLevel::Neighborhood,
            // Missing or unrecognized TXT record defaults to exact, same as
            // the original Avahi-based resolver.
            _ => AccuracyLevel::Exact,
        }
    }
}

impl NmeaDiscovery for MdnsDiscovery {
    fn poll_added(&mut self) -> Vec<ServiceInfo> {
        let mut added = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            if let mdns_sd::ServiceEvent::ServiceResolved(info) = event {
                let Some(address) = info.get_addresses().iter().next() else { continue };
                added.push(ServiceInfo {
                    identifier: info.get_fullname().to_string(),
                    endpoint: Endpoint::Tcp { host: address.to_string(), port: info.get_port() },
                    accuracy: Self::accuracy_from_txt(&info),
                    added_at: Instant::now(),
                });
            }
        }
        added
    }

    fn poll_removed(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Sort key matching `compare_avahi_service_by_accuracy_n_time`: best
/// accuracy first, ties broken by earliest discovery time.
fn service_rank(service: &ServiceInfo) -> (std::cmp::Reverse<AccuracyLevel>, Instant) {
    (std::cmp::Reverse(service.accuracy), service.added_at)
}

/// Multiplexes between discovered NMEA network services, exposing whichever
/// one is currently connected as a stream of combined GGA+RMC
/// [`LocationValue`] fixes.
pub struct NmeaMultiplexer {
    try_services: IndexMap<String, ServiceInfo>,
    broken_services: IndexMap<String, ServiceInfo>,
    active: Option<String>,
    unbreak_time: Duration,
}

impl NmeaMultiplexer {
    pub fn new(unbreak_time: Duration) -> Self {
        Self { try_services: IndexMap::new(), broken_services: IndexMap::new(), active: None, unbreak_time }
    }

    /// Register a newly discovered service, ignoring duplicates by
    /// identifier.
    pub fn add_service(&mut self, service: ServiceInfo) {
        if self.try_services.contains_key(&service.identifier)
            || self.broken_services.contains_key(&service.identifier)
        {
            return;
        }
        self.try_services.insert(service.identifier.clone(), service);
        self.sort_try_services();
    }

    /// Remove a service that's gone away, e.g. via mDNS goodbye packet.
    pub fn remove_service(&mut self, identifier: &str) {
        let removed =
            self.try_services.shift_remove(identifier).or_else(|| self.broken_services.shift_remove(identifier));
        if removed.is_some() && self.active.as_deref() == Some(identifier) {
            self.active = None;
        }
    }

    /// Move the currently active service into the broken list after a
    /// connection failure.
    pub fn mark_broken(&mut self, identifier: &str) {
        if let Some(service) = self.try_services.shift_remove(identifier) {
            self.broken_services.insert(identifier.to_string(), service);
            self.sort_broken_services();
        }
        if self.active.as_deref() == Some(identifier) {
            self.active = None;
        }
    }

    /// Whether a reconnection is needed: no active connection, no candidate
    /// services, or the best candidate isn't the currently active one.
    pub fn reconnection_required(&self) -> bool {
        match (&self.active, self.try_services.first()) {
            (None, Some(_)) => true,
            (Some(active), Some((head, _))) => active != head,
            (_, None) => false,
        }
    }

    /// The best candidate to connect to, if reconnection is required.
    pub fn next_candidate(&self) -> Option<&ServiceInfo> {
        if !self.reconnection_required() {
            return None;
        }
        self.try_services.first().map(|(_, service)| service)
    }

    pub fn set_active(&mut self, identifier: String) {
        self.active = Some(identifier);
    }

    /// Available accuracy level: best of whatever is in `try_services`
    /// (there might be a connection soon) or `broken_services` (there was a
    /// connection before and might be again).
    pub fn available_accuracy_level(&self) -> AccuracyLevel {
        let try_head = self.try_services.first().map(|(_, s)| s.accuracy).unwrap_or(AccuracyLevel::None);
        let broken_head =
            self.broken_services.first().map(|(_, s)| s.accuracy).unwrap_or(AccuracyLevel::None);
        try_head.max(broken_head)
    }

    fn sort_try_services(&mut self) {
        self.try_services.sort_by(|_, a, _, b| service_rank(a).cmp(&service_rank(b)));
    }

    fn sort_broken_services(&mut self) {
        self.broken_services.sort_by(|_, a, _, b| service_rank(a).cmp(&service_rank(b)));
    }

    /// Drive discovery, reconnection and the unbreak timer from a single
    /// owning task for as long as the multiplexer should run. Emits combined
    /// GGA+RMC fixes over `location_tx` as they arrive.
    pub async fn run(mut self, mut discovery: Box<dyn NmeaDiscovery>, location_tx: mpsc::UnboundedSender<LocationValue>) {
        loop {
            for service in discovery.poll_added() {
                self.add_service(service);
            }
            for identifier in discovery.poll_removed() {
                self.remove_service(&identifier);
            }

            if self.try_services.is_empty() && !self.broken_services.is_empty() {
                sleep(self.unbreak_time).await;
                if self.try_services.is_empty() && !self.broken_services.is_empty() {
                    debug!("Unbreaking {} NMEA service(s)", self.broken_services.len());
                    self.try_services.extend(self.broken_services.drain(..));
                    self.sort_try_services();
                }
                continue;
            }

            let Some(candidate) = self.next_candidate().cloned() else {
                sleep(POLL_INTERVAL).await;
                continue;
            };

            self.set_active(candidate.identifier.clone());
            debug!("Connecting to NMEA service {}", candidate.identifier);
            if let Err(err) = self.connect_and_stream(&candidate, &location_tx).await {
                warn!("NMEA service {} disconnected: {err}", candidate.identifier);
                self.mark_broken(&candidate.identifier);
            }
        }
    }

    /// Connect to a service and stream combined fixes until the connection
    /// drops.
    pub async fn connect_and_stream(
        &self,
        service: &ServiceInfo,
        location_tx: &mpsc::UnboundedSender<LocationValue>,
    ) -> std::io::Result<()> {
        match &service.endpoint {
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream_sentences(BufReader::new(stream), location_tx).await
            },
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                stream_sentences(BufReader::new(stream), location_tx).await
            },
        }
    }
}

/// Read NMEA sentences line by line from `reader`, pairing the most recent
/// GGA/RMC fix into a [`LocationValue`] and sending it over `location_tx`
/// whenever either updates.
async fn stream_sentences<R>(
    mut reader: R,
    location_tx: &mpsc::UnboundedSender<LocationValue>,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut last_gga: Option<Gga> = None;
    let mut last_rmc: Option<Rmc> = None;
    let mut line = String::new();

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);

        match parser::parse_sentence(trimmed) {
            Ok(Some(Sentence::Gga(gga))) => last_gga = Some(gga),
            Ok(Some(Sentence::Rmc(rmc))) => last_rmc = Some(rmc),
            Ok(None) => continue,
            Err(err) => {
                warn!("Discarding malformed NMEA sentence: {err}");
                continue;
            },
        }

        if let Some(location) = LocationValue::from_nmeas(last_gga.as_ref(), last_rmc.as_ref())
            && location_tx.send(location).is_err()
        {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, accuracy: AccuracyLevel) -> ServiceInfo {
        ServiceInfo {
            identifier: id.into(),
            endpoint: Endpoint::Tcp { host: "127.0.0.1".into(), port: 10110 },
            accuracy,
            added_at: Instant::now(),
        }
    }

    #[test]
    fn best_accuracy_service_sorts_first() {
        let mut mux = NmeaMultiplexer::new(DEFAULT_UNBREAK_TIME);
        mux.add_service(service("a", AccuracyLevel::City));
        mux.add_service(service("b", AccuracyLevel::Exact));

        assert_eq!(mux.try_services.first().unwrap().0, "b");
    }

    #[test]
    fn reconnection_required_when_head_changes() {
        let mut mux = NmeaMultiplexer::new(DEFAULT_UNBREAK_TIME);
        mux.add_service(service("a", AccuracyLevel::City));
        assert!(mux.reconnection_required());

        mux.set_active("a".into());
        assert!(!mux.reconnection_required());

        mux.add_service(service("b", AccuracyLevel::Exact));
        assert!(mux.reconnection_required());
    }

    #[test]
    fn broken_service_moves_out_of_try_list() {
        let mut mux = NmeaMultiplexer::new(DEFAULT_UNBREAK_TIME);
        mux.add_service(service("a", AccuracyLevel::City));
        mux.set_active("a".into());
        mux.mark_broken("a");

        assert!(!mux.try_services.contains_key("a"));
        assert!(mux.broken_services.contains_key("a"));
        assert!(mux.active.is_none());
    }

    #[test]
    fn duplicate_service_is_ignored() {
        let mut mux = NmeaMultiplexer::new(DEFAULT_UNBREAK_TIME);
        mux.add_service(service("a", AccuracyLevel::City));
        mux.add_service(service("a", AccuracyLevel::Exact));
        assert_eq!(mux.try_services.len(), 1);
        assert_eq!(mux.try_services["a"].accuracy, AccuracyLevel::City);
    }

    #[test]
    fn unix_socket_service_is_permanent_and_exact() {
        let service = unix_socket_service("/run/geoclued-rs/nmea.sock");
        assert_eq!(service.accuracy, AccuracyLevel::Exact);
        assert!(matches!(service.endpoint, Endpoint::Unix { .. }));
    }
}
