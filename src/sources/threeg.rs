//! Cell-tower (3GPP) based geolocation.
//!
//! Grounded in `gclue-3g.c`: a repeating 25-minute timer (re-armed whenever
//! a tower becomes available, cancelled when it's lost or the source goes
//! inactive) drives periodic `WebSourceEngine` refreshes, and the source
//! never reports better than [`AccuracyLevel::City`] since cell-based fixes
//! are inherently city-scale at best.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::location::AccuracyLevel;
use crate::mozilla::{MozillaQuery, Tower3G};
use crate::source::SourceBase;
use crate::web_source::{WebSourceEngine, reachability_became_locate_available};

/// Default repeat interval for automatic cell-derived location refresh,
/// matching GeoClue's `LOCATION_3GPP_TIMEOUT`.
pub const DEFAULT_LOCATION_3GPP_REFRESH: Duration = Duration::from_secs(25 * 60);

/// Minimum accuracy level this source will ever report, mirroring the
/// `g_return_val_if_fail (level >= GCLUE_ACCURACY_LEVEL_CITY, ...)` guard in
/// the original.
const MIN_ACCURACY_LEVEL: AccuracyLevel = AccuracyLevel::City;

pub struct ThreeGSource {
    base: Mutex<SourceBase>,
    engine: WebSourceEngine,
    query: Mutex<MozillaQuery>,
    refresh_interval: Duration,
}

impl ThreeGSource {
    pub fn new(
        client: reqwest::Client,
        locate_url: Arc<String>,
        submit_url: Arc<String>,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            base: Mutex::new(SourceBase::new()),
            engine: WebSourceEngine::new(client, locate_url, submit_url),
            query: Mutex::new(MozillaQuery::new()),
            refresh_interval,
        }
    }

    pub async fn activate(&self) {
        self.base.lock().await.activate();
    }

    pub async fn deactivate(&self) {
        self.base.lock().await.deactivate();
    }

    pub fn set_full_connectivity(&self) {
        self.engine.set_full_connectivity();
    }

    /// Record a new tower observation, e.g. from the modem adapter. A newly
    /// acquired tower immediately triggers a refresh rather than waiting for
    /// the next timer tick; losing the tower doesn't.
    pub async fn set_tower(&self, tower: Option<Tower3G>) {
        let acquired = tower.is_some();
        self.query.lock().await.set_tower(tower);
        if acquired {
            self.refresh().await;
        }
    }

    /// React to the locate endpoint becoming reachable after a period of
    /// unreachability by requesting one refresh.
    pub async fn run_reachability_watcher(&self) {
        let mut rx = self.engine.subscribe_reachability();
        let mut previous = *rx.borrow();
        while rx.changed().await.is_ok() {
            let current = *rx.borrow();
            if reachability_became_locate_available(previous, current) {
                self.refresh().await;
            }
            previous = current;
        }
    }

    /// Resolve the current cell-derived location and apply the city-level
    /// accuracy cap.
    pub async fn refresh(&self) -> Option<crate::location::LocationValue> {
        let base = self.base.lock().await;
        let query = self.query.lock().await;
        let result = self.engine.refresh(&base, &query, &[], false).await;
        drop(base);
        drop(query);

        match result {
            Ok(mut location) => {
                location.accuracy = Some(location.accuracy.map_or(5_000.0, |a| a.max(5_000.0)));
                let mut base = self.base.lock().await;
                base.set_available_accuracy_level(MIN_ACCURACY_LEVEL);
                base.set_location(location.clone());
                Some(location)
            },
            Err(err) => {
                debug!("3GPP location refresh failed: {err}");
                None
            },
        }
    }

    /// Submit the currently tracked cell tower, subject to the shared
    /// accuracy/time throttle in [`WebSourceEngine::submit`].
    pub async fn submit(&self, nickname: &str) {
        let location = match self.base.lock().await.location().cloned() {
            Some(location) => location,
            None => return,
        };
        let mut query = self.query.lock().await;
        let tower = query.tower().cloned();
        if let Err(err) = self.engine.submit(&mut query, &location, &[], tower, nickname).await {
            debug!("3GPP submission failed: {err}");
        }
    }

    /// Drive the repeating refresh timer. Cancelled implicitly by dropping
    /// the returned future (e.g. on source deactivation).
    pub async fn run_refresh_timer(&self) {
        let mut interval = time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if !self.base.lock().await.is_active() {
                continue;
            }
            self.refresh().await;
        }
    }

    pub async fn available_accuracy_level(&self) -> AccuracyLevel {
        self.base.lock().await.available_accuracy_level()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_refresh_matches_geoclue_constant() {
        assert_eq!(DEFAULT_LOCATION_3GPP_REFRESH, Duration::from_secs(1500));
    }

    #[tokio::test]
    async fn refresh_without_active_state_fails_silently() {
        let source = ThreeGSource::new(
            reqwest::Client::new(),
            Arc::new("https://example.invalid/locate".into()),
            Arc::new("https://example.invalid/submit".into()),
            DEFAULT_LOCATION_3GPP_REFRESH,
        );
        assert!(source.refresh().await.is_none());
    }
}
