use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use fnv::FnvHashMap;

/// Counts background errors per component (sysconn reconnects, pool connects, sysevent
/// dispatch, ...) so operators can tell a noisy subsystem apart from a quiet one without
/// parsing logs. Exposed as a cheap in-memory snapshot rather than a full metrics registry,
/// since exporting metrics to an external system is out of scope here.
#[derive(Default)]
pub struct Metrics {
    background_errors: RwLock<FnvHashMap<&'static str, AtomicU64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_background_error(&self, component: &'static str) {
        if let Some(counter) = self.background_errors.read().unwrap().get(component) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut table = self.background_errors.write().unwrap();
        table.entry(component).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn background_errors(&self, component: &str) -> u64 {
        self.background_errors
            .read()
            .unwrap()
            .get(component)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.background_errors
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, v.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_component() {
        let metrics = Metrics::new();
        metrics.record_background_error("sysconn");
        metrics.record_background_error("sysconn");
        metrics.record_background_error("pool");
        assert_eq!(metrics.background_errors("sysconn"), 2);
        assert_eq!(metrics.background_errors("pool"), 1);
        assert_eq!(metrics.background_errors("unused"), 0);
    }
}
