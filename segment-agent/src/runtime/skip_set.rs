//! Container filtering rules the runtime watcher applies before emitting a
//! `Start` event (spec §4.6): infra/pause images, host-network containers,
//! and privileged containers are never intercepted.

use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct SkipSet {
    image_substrings: Vec<String>,
}

impl SkipSet {
    pub fn new(image_substrings: Vec<String>) -> Self {
        Self { image_substrings }
    }

    /// The default infra-image denylist: the per-pod pause container on
    /// Kubernetes-managed hosts and the moby/buildkit sidecar.
    pub fn with_defaults() -> Self {
        Self::new(vec!["pause".to_string(), "buildkit".to_string()])
    }

    pub fn matches(&self, image: &str, host_network: bool, privileged: bool) -> bool {
        if host_network || privileged {
            return true;
        }
        self.image_substrings.iter().any(|s| image.contains(s.as_str()))
    }

    fn extend(&mut self, extra: impl IntoIterator<Item = String>) {
        for s in extra {
            if !self.image_substrings.contains(&s) {
                self.image_substrings.push(s);
            }
        }
    }
}

/// A [`SkipSet`] shared between the runtime watcher (reader, on every
/// event) and the lifecycle coordinator's `ConfigSystem` handler (writer,
/// spec §4.2). Overrides only affect containers evaluated after the
/// update lands — containers already skipped or already running are
/// unaffected, matching the watcher's one-shot evaluation per event.
#[derive(Clone)]
pub struct SharedSkipSet(Arc<RwLock<SkipSet>>);

impl SharedSkipSet {
    pub fn with_defaults(overrides: Vec<String>) -> Self {
        let mut set = SkipSet::with_defaults();
        set.extend(overrides);
        Self(Arc::new(RwLock::new(set)))
    }

    pub fn matches(&self, image: &str, host_network: bool, privileged: bool) -> bool {
        self.0.read().matches(image, host_network, privileged)
    }

    pub fn add_overrides(&self, extra: Vec<String>) {
        self.0.write().extend(extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_pause_image() {
        let set = SkipSet::with_defaults();
        assert!(set.matches("registry.k8s.io/pause:3.9", false, false));
    }

    #[test]
    fn skips_host_network_regardless_of_image() {
        let set = SkipSet::with_defaults();
        assert!(set.matches("nginx:latest", true, false));
    }

    #[test]
    fn does_not_skip_ordinary_container() {
        let set = SkipSet::with_defaults();
        assert!(!set.matches("nginx:latest", false, false));
    }
}
