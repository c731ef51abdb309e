//! Common source plumbing: activation ref-counting, accuracy-level and
//! location change notification, and the process-wide singleton registry.

use crate::location::{AccuracyLevel, LocationValue};

/// Shared state every location source composes: the current location, the
/// currently available accuracy level, and subscriber callbacks for both.
///
/// Grounded in GeoClue's `GClueLocationSource`/`GClueLocationSourceClass`
/// split: a common base plus per-kind behavior layered on top.
/// Outcome of [`SourceBase::start`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartResult {
    /// Activation ref-count went 0 → 1; the provider's activation hook
    /// should run.
    Ok,
    /// Already active; ref-count incremented, no hook re-run.
    AlreadyStarted,
    Failed,
}

/// Outcome of [`SourceBase::stop`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopResult {
    /// Activation ref-count went 1 → 0; the provider's deactivation hook
    /// should run.
    Ok,
    /// Still held by at least one other caller.
    StillUsed,
    Failed,
}

pub struct SourceBase {
    location: Option<LocationValue>,
    accuracy_level: AccuracyLevel,
    location_subscribers: Vec<Box<dyn FnMut(&LocationValue) + Send + Sync>>,
    accuracy_subscribers: Vec<Box<dyn FnMut(AccuracyLevel) + Send + Sync>>,
    active_count: usize,
}

impl Default for SourceBase {
    fn default() -> Self {
        Self {
            location: None,
            accuracy_level: AccuracyLevel::None,
            location_subscribers: Vec::new(),
            accuracy_subscribers: Vec::new(),
            active_count: 0,
        }
    }
}

impl SourceBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn location(&self) -> Option<&LocationValue> {
        self.location.as_ref()
    }

    pub fn available_accuracy_level(&self) -> AccuracyLevel {
        self.accuracy_level
    }

    /// Increment the activation ref-count. Sources only do real work
    /// (network requests, D-Bus subscriptions, file watches) while this is
    /// above zero.
    pub fn activate(&mut self) {
        self.active_count += 1;
    }

    /// Decrement the activation ref-count.
    pub fn deactivate(&mut self) {
        self.active_count = self.active_count.saturating_sub(1);
    }

    pub fn is_active(&self) -> bool {
        self.active_count > 0
    }

    /// Increment the activation ref-count, reporting whether this was the
    /// 0→1 transition the provider should react to.
    pub fn start(&mut self) -> StartResult {
        let was_active = self.is_active();
        self.activate();
        if was_active { StartResult::AlreadyStarted } else { StartResult::Ok }
    }

    /// Decrement the activation ref-count, reporting whether this was the
    /// 1→0 transition the provider should react to.
    pub fn stop(&mut self) -> StopResult {
        if !self.is_active() {
            return StopResult::Failed;
        }
        self.deactivate();
        if self.is_active() { StopResult::StillUsed } else { StopResult::Ok }
    }

    pub fn set_location(&mut self, location: LocationValue) {
        self.location = Some(location.clone());
        for subscriber in &mut self.location_subscribers {
            subscriber(&location);
        }
    }

    pub fn clear_location(&mut self) {
        self.location = None;
    }

    /// Update the available accuracy level, notifying subscribers only on
    /// an actual change so downstream consumers can connect/disconnect
    /// cheaply without redundant churn.
    pub fn set_available_accuracy_level(&mut self, level: AccuracyLevel) {
        if level == self.accuracy_level {
            return;
        }
        self.accuracy_level = level;
        for subscriber in &mut self.accuracy_subscribers {
            subscriber(level);
        }
    }

    pub fn subscribe_location(&mut self, callback: impl FnMut(&LocationValue) + Send + Sync + 'static) {
        self.location_subscribers.push(Box::new(callback));
    }

    pub fn subscribe_accuracy(&mut self, callback: impl FnMut(AccuracyLevel) + Send + Sync + 'static) {
        self.accuracy_subscribers.push(Box::new(callback));
    }
}

/// Fetch-or-create a process-wide singleton out of a `HashMap<K, Weak<...>>`
/// registry, recreating the entry if the previously handed-out `Arc` was
/// dropped.
///
/// Mirrors GeoClue's `g_object_add_weak_pointer`-based singleton sources: a
/// weak handle so the last strong reference going away frees the source
/// instead of keeping it alive for the rest of the process. Each source kind
/// keeps its own `OnceLock<Mutex<HashMap<K, Weak<Mutex<Self>>>>>` and calls
/// this helper from a `get_or_create` constructor.
pub fn singleton_get_or_create<K, T>(
    registry: &std::sync::Mutex<std::collections::HashMap<K, std::sync::Weak<std::sync::Mutex<T>>>>,
    key: K,
    create: impl FnOnce() -> T,
) -> std::sync::Arc<std::sync::Mutex<T>>
where
    K: std::hash::Hash + Eq,
{
    let mut guard = registry.lock().unwrap();
    if let Some(existing) = guard.get(&key).and_then(std::sync::Weak::upgrade) {
        return existing;
    }
    let instance = std::sync::Arc::new(std::sync::Mutex::new(create()));
    guard.insert(key, std::sync::Arc::downgrade(&instance));
    instance
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn accuracy_notification_only_fires_on_change() {
        let mut base = SourceBase::new();
        let notifications = Arc::new(Mutex::new(Vec::new()));
        let notifications_clone = Arc::clone(&notifications);
        base.subscribe_accuracy(move |level| notifications_clone.lock().unwrap().push(level));

        base.set_available_accuracy_level(AccuracyLevel::City);
        base.set_available_accuracy_level(AccuracyLevel::City);
        base.set_available_accuracy_level(AccuracyLevel::Exact);

        assert_eq!(*notifications.lock().unwrap(), vec![AccuracyLevel::City, AccuracyLevel::Exact]);
    }

    #[test]
    fn activation_is_ref_counted() {
        let mut base = SourceBase::new();
        assert!(!base.is_active());
        base.activate();
        base.activate();
        assert!(base.is_active());
        base.deactivate();
        assert!(base.is_active());
        base.deactivate();
        assert!(!base.is_active());
    }

    #[test]
    fn start_stop_report_transition_edges() {
        let mut base = SourceBase::new();
        assert_eq!(base.start(), StartResult::Ok);
        assert_eq!(base.start(), StartResult::AlreadyStarted);
        assert_eq!(base.stop(), StopResult::StillUsed);
        assert_eq!(base.stop(), StopResult::Ok);
        assert_eq!(base.stop(), StopResult::Failed);
    }

    #[test]
    fn singleton_is_recreated_after_drop() {
        let registry: Mutex<HashMap<bool, std::sync::Weak<Mutex<u32>>>> = Mutex::new(HashMap::new());

        let first = singleton_get_or_create(&registry, true, || 1);
        let second = singleton_get_or_create(&registry, true, || 2);
        assert!(Arc::ptr_eq(&first, &second));

        drop(first);
        drop(second);
        let third = singleton_get_or_create(&registry, true, || 3);
        assert_eq!(*third.lock().unwrap(), 3);
    }
}
