use std::collections::HashSet;
use std::sync::Mutex;

/// Tracks which gateway hosts are currently excluded from selection,
/// either because dialing them failed or because they announced a drain.
pub struct HostsManager {
	inner: Mutex<HostsState>,
}

struct HostsState {
	hosts: Vec<String>,
	unreachable: HashSet<String>,
	draining: HashSet<String>,
}

impl HostsManager {
	pub fn new(hosts: Vec<String>) -> Self {
		HostsManager {
			inner: Mutex::new(HostsState {
				hosts,
				unreachable: HashSet::new(),
				draining: HashSet::new(),
			}),
		}
	}

	/// First host that is neither unreachable nor draining.
	pub fn select(&self) -> Option<String> {
		let state = self.inner.lock().expect("hosts lock poisoned");

		state
			.hosts
			.iter()
			.find(|host| !state.unreachable.contains(*host) && !state.draining.contains(*host))
			.cloned()
	}

	pub fn mark_unreachable(&self, host: &str) {
		let mut state = self.inner.lock().expect("hosts lock poisoned");
		state.unreachable.insert(host.to_string());
	}

	pub fn mark_draining(&self, host: &str) {
		let mut state = self.inner.lock().expect("hosts lock poisoned");
		state.draining.insert(host.to_string());
	}

	/// Clears every exclusion so selection can retry from scratch.
	pub fn reset(&self) {
		let mut state = self.inner.lock().expect("hosts lock poisoned");
		state.unreachable.clear();
		state.draining.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn excluded_hosts_are_skipped_until_reset() {
		let hosts = HostsManager::new(vec!["a".to_string(), "b".to_string()]);

		assert_eq!(hosts.select().as_deref(), Some("a"));

		hosts.mark_unreachable("a");
		assert_eq!(hosts.select().as_deref(), Some("b"));

		hosts.mark_draining("b");
		assert_eq!(hosts.select(), None);

		hosts.reset();
		assert_eq!(hosts.select().as_deref(), Some("a"));
	}
}
