//! Shared HTTP request engine backing the web-derived location sources
//! (Wi-Fi and 3G).
//!
//! Grounded in `gclue-web-source.c`: single-flight refresh requests, network
//! reachability tracking that overrides per-URL probes when the system
//! reports full connectivity, and submission throttling by both accuracy and
//! time. The request/response plumbing itself follows the
//! `geocoder/nominatim.rs` idiom of a dedicated `reqwest::Client` driving one
//! query at a time with results delivered over a channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::error::RefreshError;
use crate::location::{AccuracyLevel, LocationValue, now_millis};
use crate::mozilla::{Bss, MozillaQuery, Tower3G};
use crate::source::SourceBase;

/// Accuracy threshold below which a location is considered precise enough to
/// submit, mirroring GeoClue's `SUBMISSION_ACCURACY_THRESHOLD`.
const SUBMISSION_ACCURACY_THRESHOLD: f64 = 100.0;
/// Minimum spacing, in milliseconds, between two submissions.
const SUBMISSION_TIME_THRESHOLD_MS: u64 = 60 * 1000;

/// Network reachability for a web source's locate/submit endpoints.
#[derive(Default, Clone, Copy, Debug)]
pub struct Reachability {
    pub locate: bool,
    pub submit: bool,
}

/// Shared HTTP engine used by any source that resolves location via the
/// Mozilla Location Service wire protocol.
///
/// Enforces the single-flight invariant from the spec: at most one locate
/// request may be in flight at a time, tracked via `in_flight`.
pub struct WebSourceEngine {
    client: reqwest::Client,
    locate_url: Arc<String>,
    submit_url: Arc<String>,
    in_flight: Mutex<()>,
    last_submitted_ms: Mutex<Option<u64>>,
    reachability: watch::Sender<Reachability>,
}

impl WebSourceEngine {
    pub fn new(client: reqwest::Client, locate_url: Arc<String>, submit_url: Arc<String>) -> Self {
        let (reachability, _) = watch::channel(Reachability::default());
        Self {
            client,
            locate_url,
            submit_url,
            in_flight: Mutex::new(()),
            last_submitted_ms: Mutex::new(None),
            reachability,
        }
    }

    /// Record a new reachability state for the locate/submit endpoints.
    ///
    /// A connectivity monitor reporting full connectivity overrides
    /// per-endpoint probe results: mirrors `get_internet_available` in the
    /// original source, where `G_NETWORK_CONNECTIVITY_FULL` short-circuits
    /// the per-URL `can_reach_async` checks.
    pub fn set_full_connectivity(&self) {
        let _ = self.reachability.send(Reachability { locate: true, submit: true });
    }

    pub fn set_reachability(&self, reachability: Reachability) {
        let _ = self.reachability.send(reachability);
    }

    pub fn locate_reachable(&self) -> bool {
        self.reachability.borrow().locate
    }

    /// Subscribe to reachability changes, e.g. to refresh once the locate
    /// endpoint transitions from unreachable to reachable.
    pub fn subscribe_reachability(&self) -> watch::Receiver<Reachability> {
        self.reachability.subscribe()
    }

    /// Resolve a location from the given Wi-Fi/cell observations.
    ///
    /// Fails with [`RefreshError::Pending`] if another refresh is already in
    /// flight, [`RefreshError::NotInitialized`] if the source isn't active,
    /// and [`RefreshError::NetworkUnreachable`] if the locate endpoint is
    /// known unreachable.
    pub async fn refresh(
        &self,
        base: &SourceBase,
        query: &MozillaQuery,
        bsses: &[Bss],
        skip_tower: bool,
    ) -> Result<LocationValue, RefreshError> {
        if !base.is_active() {
            return Err(RefreshError::NotInitialized);
        }
        if !self.locate_reachable() {
            return Err(RefreshError::NetworkUnreachable);
        }

        let guard = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Err(RefreshError::Pending),
        };

        let (body, description) = query.create_locate_request(bsses, skip_tower);
        let payload = body.to_json().map_err(crate::mozilla::QueryError::from)?;

        let response =
            self.client.post(self.locate_url.as_str()).header("content-type", "application/json").body(payload).send().await;
        drop(guard);

        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => {
                debug!("Query location request error: {err}");
                return Err(RefreshError::Request(err));
            },
            Err(err) => {
                warn!("Query location request error: {err}");
                return Err(RefreshError::Request(err));
            },
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Query location SOUP error: {status}");
            return Err(RefreshError::HttpStatus(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        let result = query.parse_locate_response(&bytes, description)?;
        debug!("Resolved location via {}", result.description);
        Ok(result.location)
    }

    /// Determine the accuracy level available from this engine without
    /// performing a request: `Exact` when the locate URL is reachable, else
    /// `None`. Callers for sources with other fallbacks (e.g. 3G falling
    /// back to cached cell data) layer their own logic on top.
    pub fn available_accuracy_level(&self) -> AccuracyLevel {
        if self.locate_reachable() { AccuracyLevel::Exact } else { AccuracyLevel::None }
    }

    /// Submit observations if submission is enabled, the location is recent
    /// and precise enough, and the minimum submission interval has passed.
    ///
    /// Updates the dedup bookkeeping in `query` and the submission
    /// timestamp *before* the request is sent, matching
    /// `on_submit_source_location_notify` in the original source: this
    /// deliberately avoids retry storms if the POST itself fails or hangs.
    pub async fn submit(
        &self,
        query: &mut MozillaQuery,
        location: &LocationValue,
        bsses: &[Bss],
        tower: Option<Tower3G>,
        nickname: &str,
    ) -> Result<(), RefreshError> {
        if !self.reachability.borrow().submit {
            return Ok(());
        }

        let accuracy = match location.accuracy {
            Some(accuracy) if accuracy <= SUBMISSION_ACCURACY_THRESHOLD => accuracy,
            _ => return Ok(()),
        };
        let _ = accuracy;

        {
            let mut last_submitted = self.last_submitted_ms.lock().await;
            if let Some(last) = *last_submitted
                && location.timestamp < last + SUBMISSION_TIME_THRESHOLD_MS
            {
                return Ok(());
            }
            *last_submitted = Some(location.timestamp);
        }

        query.set_tower(tower);
        if !query.needs_submit() {
            return Ok(());
        }

        let payload = build_submit_payload(location, bsses, query, now_millis());
        query.mark_submitted();

        let mut request = self.client.post(self.submit_url.as_str()).json(&payload);
        if !nickname.is_empty() {
            request = request.header("X-Nickname", nickname);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!("Submitted location observation");
            },
            Ok(response) => warn!("Submit query SOUP error: {}", response.status()),
            Err(err) => warn!("Submit query request error: {err}"),
        }

        Ok(())
    }
}

fn build_submit_payload(
    location: &LocationValue,
    bsses: &[Bss],
    query: &MozillaQuery,
    timestamp: u64,
) -> serde_json::Value {
    let wifi_access_points: Vec<_> = bsses
        .iter()
        .map(|bss| {
            serde_json::json!({
                "macAddress": bss.bssid.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":"),
                "signalStrength": bss.signal_strength,
                "age": bss.age_secs * 1000,
                "frequency": bss.frequency,
            })
        })
        .collect();

    // Same fields as the locate request's cellTowers, minus the per-tower
    // radioType: the submit form doesn't carry one.
    let cell_towers: Vec<_> = query
        .tower()
        .and_then(|tower| tower.mcc_mnc().map(|mcc_mnc| (tower, mcc_mnc)))
        .map(|(tower, (mcc, mnc))| {
            vec![serde_json::json!({
                "cellId": tower.cell_id,
                "mobileCountryCode": mcc,
                "mobileNetworkCode": mnc,
                "locationAreaCode": tower.location_area_code,
            })]
        })
        .unwrap_or_default();

    let mut position = serde_json::json!({
        "latitude": location.latitude,
        "longitude": location.longitude,
    });
    if let Some(accuracy) = location.accuracy {
        position["accuracy"] = accuracy.into();
    }
    if let Some(altitude) = location.altitude {
        position["altitude"] = altitude.into();
    }
    if let Some(speed) = location.speed {
        position["speed"] = speed.into();
    }

    let mut item = serde_json::json!({
        "timestamp": timestamp,
        "position": position,
        "wifiAccessPoints": wifi_access_points,
    });
    if !cell_towers.is_empty() {
        item["cellTowers"] = cell_towers.into();
    }

    serde_json::json!({ "items": [item] })
}

/// How long to wait before considering a stale reachability probe
/// authoritative again, used when a source wants to retry after a period of
/// unreachability without waiting on the connectivity monitor.
pub const REACHABILITY_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// True when `locate` transitioned from unreachable to reachable, the one
/// case a source should react to with an unsolicited refresh.
pub fn reachability_became_locate_available(previous: Reachability, current: Reachability) -> bool {
    !previous.locate && current.locate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_fails_when_inactive() {
        let engine = WebSourceEngine::new(
            reqwest::Client::new(),
            Arc::new("https://example.invalid/locate".into()),
            Arc::new("https://example.invalid/submit".into()),
        );
        engine.set_full_connectivity();
        let base = SourceBase::new();
        let query = MozillaQuery::new();

        let err = engine.refresh(&base, &query, &[], false).await.unwrap_err();
        assert!(matches!(err, RefreshError::NotInitialized));
    }

    #[tokio::test]
    async fn refresh_fails_when_unreachable() {
        let engine = WebSourceEngine::new(
            reqwest::Client::new(),
            Arc::new("https://example.invalid/locate".into()),
            Arc::new("https://example.invalid/submit".into()),
        );
        let mut base = SourceBase::new();
        base.activate();
        let query = MozillaQuery::new();

        let err = engine.refresh(&base, &query, &[], false).await.unwrap_err();
        assert!(matches!(err, RefreshError::NetworkUnreachable));
    }

    #[tokio::test]
    async fn submit_skips_imprecise_location() {
        let engine = WebSourceEngine::new(
            reqwest::Client::new(),
            Arc::new("https://example.invalid/locate".into()),
            Arc::new("https://example.invalid/submit".into()),
        );
        engine.set_full_connectivity();
        let mut query = MozillaQuery::new();
        let location = LocationValue::new(1.0, 2.0, Some(500.0)).unwrap();

        engine.submit(&mut query, &location, &[], None, "").await.unwrap();
        assert!(query.needs_submit());
    }

    #[test]
    fn reachability_transition_only_fires_false_to_true() {
        let unreachable = Reachability { locate: false, submit: false };
        let reachable = Reachability { locate: true, submit: false };
        assert!(reachability_became_locate_available(unreachable, reachable));
        assert!(!reachability_became_locate_available(reachable, reachable));
        assert!(!reachability_became_locate_available(reachable, unreachable));
    }
}
