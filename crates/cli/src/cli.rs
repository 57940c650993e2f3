use clap::Parser;

/// Frame-driven task loop.
///
/// Registers a per-frame counter, a delayed heartbeat and an optional run
/// limit, then drives them until interrupted or the limit is reached.
#[derive(Parser, Debug, Default)]
#[command(name = "frameloop", version, about = "Frame-driven cooperative task loop")]
pub struct CliArgs {
    /// Path to config file (default: ~/.config/frameloop/config.toml)
    #[arg(long, env = "FRAMELOOP_CONFIG")]
    pub config: Option<String>,

    /// Run the loop on a background thread instead of the calling thread
    #[arg(long, env = "FRAMELOOP_THREADED")]
    pub threaded: bool,

    /// Sleep between cycles in milliseconds (0 = busy-cycle)
    #[arg(long, env = "FRAMELOOP_IDLE_SLEEP_MS")]
    pub idle_sleep_ms: Option<u64>,

    /// Seconds between heartbeat log lines
    #[arg(long)]
    pub heartbeat_secs: Option<f64>,

    /// Stop after this many cycles
    #[arg(long)]
    pub cycles: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    pub duration_secs: Option<f64>,
}
