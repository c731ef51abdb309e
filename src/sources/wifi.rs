//! Wi-Fi based geolocation.
//!
//! Thin wrapper around [`WebSourceEngine`]: resolves location from the
//! currently visible Wi-Fi access points, supplied by whatever
//! [`WifiProvider`] the daemon is wired up with (out of scope here is the
//! actual BSS scanning, normally done via `org.freedesktop.NetworkManager`).

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::location::{AccuracyLevel, LocationValue};
use crate::mozilla::{Bss, MozillaQuery};
use crate::source::SourceBase;
use crate::web_source::{WebSourceEngine, reachability_became_locate_available};

/// Abstracts the Wi-Fi BSS scan source so [`WifiSource`] is testable
/// without a real D-Bus connection to NetworkManager.
pub trait WifiProvider: Send + Sync {
    fn visible_bsses(&self) -> Vec<Bss>;
}

pub struct WifiSource {
    base: Mutex<SourceBase>,
    engine: WebSourceEngine,
    query: Mutex<MozillaQuery>,
    provider: Arc<dyn WifiProvider>,
}

impl WifiSource {
    pub fn new(
        client: reqwest::Client,
        locate_url: Arc<String>,
        submit_url: Arc<String>,
        provider: Arc<dyn WifiProvider>,
    ) -> Self {
        Self {
            base: Mutex::new(SourceBase::new()),
            engine: WebSourceEngine::new(client, locate_url, submit_url),
            query: Mutex::new(MozillaQuery::new()),
            provider,
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

    pub async fn refresh(&self) -> Option<LocationValue> {
        let bsses = self.provider.visible_bsses();
        let base = self.base.lock().await;
        let query = self.query.lock().await;
        let result = self.engine.refresh(&base, &query, &bsses, true).await;
        drop(base);
        drop(query);

        match result {
            Ok(location) => {
                let mut base = self.base.lock().await;
                base.set_available_accuracy_level(AccuracyLevel::Exact);
                base.set_location(location.clone());
                self.query.lock().await.set_bss_dirty();
                Some(location)
            },
            Err(err) => {
                debug!("Wi-Fi location refresh failed: {err}");
                None
            },
        }
    }

    /// Submit the current scan and location, subject to the shared
    /// accuracy/time throttle in [`WebSourceEngine::submit`].
    pub async fn submit(&self, nickname: &str) {
        let location = match self.base.lock().await.location().cloned() {
            Some(location) => location,
            None => return,
        };
        let bsses = self.provider.visible_bsses();
        let mut query = self.query.lock().await;
        if let Err(err) = self.engine.submit(&mut query, &location, &bsses, None, nickname).await {
            debug!("Wi-Fi submission failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyProvider;
    impl WifiProvider for EmptyProvider {
        fn visible_bsses(&self) -> Vec<Bss> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn refresh_without_activation_fails() {
        let source = WifiSource::new(
            reqwest::Client::new(),
            Arc::new("https://example.invalid/locate".into()),
            Arc::new("https://example.invalid/submit".into()),
            Arc::new(EmptyProvider),
        );
        assert!(source.refresh().await.is_none());
    }
}
