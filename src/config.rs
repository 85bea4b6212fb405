use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "imagner-gateway")]
#[command(about = "Caching, single-flight gateway in front of an image generation backend")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Image generation backend
    #[arg(short, long, default_value = "http://localhost:3000")]
    pub backend_url: String,

    // Cache TTL in seconds
    #[arg(short, long, default_value_t = 24 * 60 * 60)]
    pub cache_ttl: u64,

    // Attempts per job, first one included
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    // First retry delay in milliseconds, doubled on every further retry
    #[arg(long, default_value_t = 1000)]
    pub backoff_base_ms: u64,

    // Per-attempt timeout in seconds, 0 disables it
    #[arg(long, default_value_t = 0)]
    pub attempt_timeout: u64,

    // Progress tick interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub progress_interval_ms: u64,

    // How many recent prompts to remember
    #[arg(long, default_value_t = 10)]
    pub recent_capacity: usize,

    // Submission channel bound
    #[arg(long, default_value_t = 100)]
    pub queue_capacity: usize,

    // Local state file (cache + recent prompts)
    #[arg(long, default_value = "imagner-state.json")]
    pub state_file: PathBuf,

    // Optional history store that receives every generated image
    #[arg(long)]
    pub persist_url: Option<String>,

    // Path probed for reachability; any HTTP answer counts as online
    #[arg(long, default_value = "/")]
    pub probe_path: String,

    // Connectivity check interval in seconds
    #[arg(long, default_value_t = 30)]
    pub health_interval: u64,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub cache_ttl: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub attempt_timeout: Option<Duration>,
    pub progress_interval: Duration,
    pub recent_capacity: usize,
    pub queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            attempt_timeout: None,
            progress_interval: Duration::from_secs(1),
            recent_capacity: 10,
            queue_capacity: 100,
        }
    }
}

impl OrchestratorConfig {
    /// Delay before attempt `attempt + 1`: base, 2x base, 4x base, ...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

impl From<&Args> for OrchestratorConfig {
    fn from(args: &Args) -> Self {
        Self {
            cache_ttl: Duration::from_secs(args.cache_ttl),
            max_attempts: args.max_attempts.max(1),
            backoff_base: Duration::from_millis(args.backoff_base_ms),
            attempt_timeout: (args.attempt_timeout > 0)
                .then(|| Duration::from_secs(args.attempt_timeout)),
            progress_interval: Duration::from_millis(args.progress_interval_ms.max(1)),
            recent_capacity: args.recent_capacity,
            queue_capacity: args.queue_capacity,
        }
    }
}
