// Torpool CLI
//
// Design Decision: Use clap derive; every pool flag falls back to the same
// TORPOOL_* variable PoolConfig::from_env reads.
// Design Decision: Support text/json output formats for scripting.
// Design Decision: Every command that opens a pool shuts it down, also on Ctrl-C.

mod commands;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use torpool::telemetry::{init_telemetry, TelemetryConfig};
use torpool::PoolConfig;

#[derive(Parser)]
#[command(name = "torpool")]
#[command(about = "torpool - Run work through a pool of Tor daemons")]
#[command(version)]
pub struct Cli {
    /// Path to the tor executable
    #[arg(long, env = "TORPOOL_TOR_BINARY")]
    pub tor: Option<PathBuf>,

    /// Number of Tor instances
    #[arg(long, short = 'n', env = "TORPOOL_INSTANCES")]
    pub instances: Option<usize>,

    /// Directory under which instance data directories are created
    #[arg(long, env = "TORPOOL_DATA_ROOT")]
    pub data_root: Option<PathBuf>,

    /// Seconds to wait for each daemon to bootstrap
    #[arg(long, env = "TORPOOL_BOOTSTRAP_TIMEOUT_SECS")]
    pub bootstrap_timeout: Option<u64>,

    /// Leave data directories behind on shutdown
    #[arg(long, env = "TORPOOL_KEEP_DATA_DIRS")]
    pub keep_data_dirs: bool,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Environment configuration with command-line overrides applied
    fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::from_env();
        if let Some(tor) = &self.tor {
            config = config.with_tor_binary(tor);
        }
        if let Some(instances) = self.instances {
            config = config.with_instances(instances);
        }
        if let Some(root) = &self.data_root {
            config = config.with_data_root(root);
        }
        if let Some(secs) = self.bootstrap_timeout {
            config = config.with_bootstrap_timeout(Duration::from_secs(secs));
        }
        if self.keep_data_dirs {
            config = config.with_keep_data_dirs(true);
        }
        config
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Look up the exit address of every request
    Ip {
        /// Number of requests to spread over the pool
        #[arg(long, short, default_value = "10")]
        requests: usize,

        /// JSON endpoint reporting the caller's address in an "origin" field
        #[arg(long, default_value = commands::ip::DEFAULT_URL)]
        url: String,

        /// Do not rotate identity before each request
        #[arg(long)]
        no_rotate: bool,

        /// Per-request timeout in seconds
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Start the pool, list its instances, then stop it
    Instances,

    /// Generate a control password and its Tor hash
    Hash {
        /// Password to hash (random if omitted)
        password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "warn")
    // - TORPOOL_LOG_FORMAT: "text" or "json"
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("warn".to_string());
    }
    init_telemetry(&telemetry_config);

    let cli = Cli::parse();
    let config = cli.pool_config();
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Ip {
            requests,
            url,
            no_rotate,
            timeout,
        } => {
            let options = commands::ip::IpOptions {
                requests,
                url,
                rotate: !no_rotate,
                timeout: Duration::from_secs(timeout),
            };
            commands::ip::run(config, options, output_format, cli.quiet).await
        }
        Commands::Instances => commands::instances::run(config, output_format, cli.quiet).await,
        Commands::Hash { password } => commands::hash::run(&config, password, output_format).await,
    }
}
