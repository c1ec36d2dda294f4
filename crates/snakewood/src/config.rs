use std::time::Duration;

/// Configuration for a snakewood Router.
#[derive(Clone)]
pub struct Config {
    /// How often the snake maintenance tick fires. Default: 1 second.
    pub snake_maintain_interval: Duration,
    /// Timeout before a snake table entry is considered expired. Default: 1 hour.
    pub snake_expiry_period: Duration,
    /// How often a root node re-announces itself. Default: 30 seconds.
    pub tree_announce_interval: Duration,
    /// Timeout before a stored peer announcement expires. Default: 90 seconds.
    pub tree_announce_timeout: Duration,
    /// Delay before sending a keepalive to an idle peer. Default: 3 seconds.
    pub peer_keepalive_interval: Duration,
    /// Timeout before considering a silent peer dead. Default: 10 seconds.
    pub peer_timeout: Duration,
    /// Maximum size of a single peer message. Default: 1 MB.
    pub peer_max_message_size: u64,
    /// Whether to send keepalives and enforce read deadlines. Default: true.
    pub keepalives: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snake_maintain_interval: Duration::from_secs(1),
            snake_expiry_period: Duration::from_secs(60 * 60),
            tree_announce_interval: Duration::from_secs(30),
            tree_announce_timeout: Duration::from_secs(90),
            peer_keepalive_interval: Duration::from_secs(3),
            peer_timeout: Duration::from_secs(10),
            peer_max_message_size: 1024 * 1024,
            keepalives: true,
        }
    }
}

impl Config {
    pub fn with_snake_maintain_interval(mut self, d: Duration) -> Self {
        self.snake_maintain_interval = d;
        self
    }

    pub fn with_snake_expiry_period(mut self, d: Duration) -> Self {
        self.snake_expiry_period = d;
        self
    }

    pub fn with_tree_announce_interval(mut self, d: Duration) -> Self {
        self.tree_announce_interval = d;
        self
    }

    pub fn with_tree_announce_timeout(mut self, d: Duration) -> Self {
        self.tree_announce_timeout = d;
        self
    }

    pub fn with_peer_keepalive_interval(mut self, d: Duration) -> Self {
        self.peer_keepalive_interval = d;
        self
    }

    pub fn with_peer_timeout(mut self, d: Duration) -> Self {
        self.peer_timeout = d;
        self
    }

    pub fn with_peer_max_message_size(mut self, size: u64) -> Self {
        self.peer_max_message_size = size;
        self
    }

    pub fn with_keepalives(mut self, enabled: bool) -> Self {
        self.keepalives = enabled;
        self
    }
}
