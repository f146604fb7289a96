use std::time::Duration;

use rand::Rng;

use crate::protocol::MAX_FRAME_LEN;

pub const DEFAULT_BLOCK_SIZE: u32 = 1 << 14;
/// Largest block whose `piece` message (id, index, begin, data) still fits a frame.
pub const MAX_BLOCK_SIZE: u32 = MAX_FRAME_LEN - 9;
pub const DEFAULT_PORT: u16 = 6881;

const CLIENT_CODE: &str = "-RT0001-";

/// How a failed piece is put back on the work queue.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Wait before the first retry.
    pub delay: Duration,
    /// Each further retry waits this many times longer. 1 keeps the delay fixed.
    pub backoff_factor: u32,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(500),
            backoff_factor: 1,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_factor
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a piece that has failed `attempts` times may be tried again.
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts < max)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub block_size: u32,
    /// Advertise extension protocol support in the handshake.
    pub extensions: bool,
    pub retry: RetryPolicy,
    /// A worker exits after this many consecutive failed pieces.
    pub evict_after: Option<u32>,
    /// Upper bound for a single framed read. `None` waits forever.
    pub io_timeout: Option<Duration>,
}

impl ClientConfig {
    /// `block_size` forced into `1..=MAX_BLOCK_SIZE`.
    pub fn clamped_block_size(&self) -> u32 {
        self.block_size.clamp(1, MAX_BLOCK_SIZE)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            port: DEFAULT_PORT,
            block_size: DEFAULT_BLOCK_SIZE,
            extensions: true,
            retry: RetryPolicy::default(),
            evict_after: None,
            io_timeout: None,
        }
    }
}

// client code followed by 12 random digits, 20 bytes in total
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::rng();
    let random_digits: u64 = rng.random_range(100_000_000_000..=999_999_999_999);

    let mut id = [0u8; 20];
    id.copy_from_slice(format!("{CLIENT_CODE}{random_digits}").as_bytes());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert!(id.starts_with(CLIENT_CODE.as_bytes()));
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn default_retry_is_fixed_and_unbounded() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.delay_for(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for(10), Duration::from_millis(500));
        assert!(retry.allows(u32::MAX - 1));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let retry = RetryPolicy {
            delay: Duration::from_millis(100),
            backoff_factor: 2,
            max_delay: Duration::from_millis(500),
            max_attempts: Some(3),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for(4), Duration::from_millis(500));
        assert!(retry.allows(2));
        assert!(!retry.allows(3));
    }

    #[test]
    fn block_size_stays_within_a_frame() {
        let config = |block_size| ClientConfig {
            block_size,
            ..ClientConfig::default()
        };
        assert_eq!(config(0).clamped_block_size(), 1);
        assert_eq!(config(DEFAULT_BLOCK_SIZE).clamped_block_size(), DEFAULT_BLOCK_SIZE);
        assert_eq!(config(u32::MAX).clamped_block_size(), MAX_BLOCK_SIZE);
        // a full block plus the 9 byte header is exactly one frame
        assert_eq!(MAX_BLOCK_SIZE + 9, MAX_FRAME_LEN);
    }
}
