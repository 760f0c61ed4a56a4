use std::time::Duration;

/// Restart timing shared by every managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartSettings {
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// Uptime after which the restart counter goes back to zero.
	pub stability_threshold: Duration,
}

impl Default for RestartSettings {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(500),
			max_delay: Duration::from_secs(30),
			stability_threshold: Duration::from_secs(10),
		}
	}
}

impl RestartSettings {
	/// Delay before restart number `attempt` (1-based): base doubled per attempt, capped.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		if attempt == 0 {
			return Duration::ZERO;
		}
		let shift = (attempt - 1).min(31);
		let factor = 1u32 << shift;
		self.base_delay
			.checked_mul(factor)
			.unwrap_or(self.max_delay)
			.min(self.max_delay)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn settings(base_ms: u64, max_ms: u64) -> RestartSettings {
		RestartSettings {
			base_delay: Duration::from_millis(base_ms),
			max_delay: Duration::from_millis(max_ms),
			stability_threshold: Duration::from_secs(1),
		}
	}

	#[test]
	fn doubles_per_attempt() {
		let s = settings(100, 10_000);
		assert_eq!(s.delay_for(1), Duration::from_millis(100));
		assert_eq!(s.delay_for(2), Duration::from_millis(200));
		assert_eq!(s.delay_for(3), Duration::from_millis(400));
		assert_eq!(s.delay_for(4), Duration::from_millis(800));
	}

	#[test]
	fn capped_at_max() {
		let s = settings(100, 500);
		assert_eq!(s.delay_for(3), Duration::from_millis(400));
		assert_eq!(s.delay_for(4), Duration::from_millis(500));
		assert_eq!(s.delay_for(40), Duration::from_millis(500));
	}

	#[test]
	fn zeroth_attempt_is_immediate() {
		assert_eq!(settings(100, 500).delay_for(0), Duration::ZERO);
	}
}
