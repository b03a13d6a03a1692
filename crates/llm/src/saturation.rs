//! Fleet saturation per model group, fed back into admission.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rate_limit::Storage;
use tokio::time::Instant;

use crate::provider::GroupCapacity;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct UsageWindow {
    events: VecDeque<(Instant, u64)>,
}

impl UsageWindow {
    fn trim(&mut self, now: Instant) {
        while self
            .events
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= WINDOW)
        {
            self.events.pop_front();
        }
    }

    fn totals(&self) -> (u64, u64) {
        let tokens = self.events.iter().map(|(_, tokens)| tokens).sum();
        (self.events.len() as u64, tokens)
    }
}

/// Tracks the last minute of upstream usage per model group and publishes how close
/// each group is to its configured capacity.
///
/// Values are derived from the live windows only. A group without traffic in the last
/// minute counts as idle, and the published values expire in storage when nothing
/// refreshes them.
pub(crate) struct SaturationCoordinator {
    storage: Arc<Storage>,
    capacities: BTreeMap<String, GroupCapacity>,
    windows: DashMap<String, UsageWindow>,
}

impl SaturationCoordinator {
    pub fn new(storage: Arc<Storage>, capacities: BTreeMap<String, GroupCapacity>) -> Self {
        Self {
            storage,
            capacities,
            windows: DashMap::new(),
        }
    }

    /// Record a successful upstream call and publish the new saturation of its group and
    /// of the whole process. Groups without a configured capacity are ignored.
    pub async fn record(&self, group: &str, tokens: u64) {
        if !self.capacities.contains_key(group) {
            return;
        }

        let now = Instant::now();

        self.windows
            .entry(group.to_string())
            .or_default()
            .events
            .push_back((now, tokens));

        let (live, idle) = self.refresh(now);

        let saturation = live.get(group).copied().unwrap_or(0.0);
        let global = live.values().copied().fold(0.0, f64::max);

        log::debug!("Saturation of model group '{group}' is {saturation:.3}, process-wide {global:.3}");

        for idle_group in idle {
            log::debug!("Model group '{idle_group}' has been idle for a minute");

            if let Err(e) = self.storage.set_saturation(&idle_group, 0.0, global).await {
                log::warn!("Failed to publish saturation of model group '{idle_group}': {e}");
            }
        }

        if let Err(e) = self.storage.set_saturation(group, saturation, global).await {
            log::warn!("Failed to publish saturation of model group '{group}': {e}");
        }
    }

    /// Saturation of a group over the last minute, `None` when it saw no traffic.
    #[cfg(test)]
    pub fn current(&self, group: &str) -> Option<f64> {
        let capacity = self.capacities.get(group)?;
        let mut window = self.windows.get_mut(group)?;

        window.trim(Instant::now());

        if window.events.is_empty() {
            return None;
        }

        let (requests, tokens) = window.totals();

        Some(saturation(*capacity, requests, tokens))
    }

    // Trims every window and returns the saturation of the groups still in use, together
    // with the groups whose last traffic just left the window.
    fn refresh(&self, now: Instant) -> (BTreeMap<String, f64>, Vec<String>) {
        let mut idle = Vec::new();

        self.windows.retain(|group, window| {
            window.trim(now);

            if window.events.is_empty() {
                idle.push(group.clone());
                return false;
            }

            true
        });

        let live = self
            .windows
            .iter()
            .filter_map(|entry| {
                let capacity = self.capacities.get(entry.key())?;
                let (requests, tokens) = entry.value().totals();

                Some((entry.key().clone(), saturation(*capacity, requests, tokens)))
            })
            .collect();

        (live, idle)
    }
}

fn saturation(capacity: GroupCapacity, requests: u64, tokens: u64) -> f64 {
    let ratio = |used: u64, capacity: Option<u64>| match capacity {
        Some(capacity) if capacity > 0 => used as f64 / capacity as f64,
        _ => 0.0,
    };

    ratio(tokens, capacity.tpm)
        .max(ratio(requests, capacity.rpm))
        .clamp(0.0, 1.0)
}
