//! CLI argument parsing using clap v4

use clap::{Parser, Subcommand, ValueEnum};

/// Switchyard - sequenced broadcast, resilient requests and worker dispatch
///
/// Runs the broadcast log, replay service, dispatch router and result
/// aggregator, or any single piece of them, over plain TCP.
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "SWITCHYARD_CONFIG")]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the broadcast log, replay service, router and aggregator
    Serve {
        /// Do not append periodic `{seq, ts}` events
        #[arg(long)]
        no_producer: bool,
    },

    /// Run a worker that registers with the router and echoes requests
    Worker {
        /// Worker index; the identity is its 2-byte little-endian form
        #[arg(short, long)]
        index: Option<u16>,
    },

    /// Run a reply server for resilient requests
    ReplyServer {
        /// Address to bind (defaults to channel.endpoint)
        #[arg(long)]
        bind: Option<String>,

        /// Stall the first N replies
        #[arg(long, default_value = "0")]
        delay_first_n: usize,

        /// How long each stalled reply waits, in milliseconds
        #[arg(long, default_value = "1500")]
        delay_ms: u64,
    },

    /// Send one request through the resilient channel
    ///
    /// Against `serve` the request is dispatched to a worker and the
    /// worker's result is printed.
    Request {
        /// Request body, JSON or plain text
        message: String,
    },

    /// Run an in-process walkthrough of one pattern
    Demo {
        #[arg(value_enum)]
        scenario: DemoScenario,

        /// Live events to receive before replaying (pubsub)
        #[arg(long, default_value = "5")]
        live: usize,

        /// Workers to start (round-robin)
        #[arg(long, default_value = "2")]
        workers: usize,

        /// Requests to dispatch (round-robin)
        #[arg(long, default_value = "10")]
        requests: usize,

        /// Replies the server stalls (reqrep)
        #[arg(long, default_value = "2")]
        delay_first_n: usize,

        /// Stall per delayed reply in milliseconds (reqrep)
        #[arg(long, default_value = "1500")]
        delay_ms: u64,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoScenario {
    /// Live stream plus catch-up replay
    Pubsub,
    /// Request/reply against a slow server
    Reqrep,
    /// Round-robin dispatch with result aggregation
    RoundRobin,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the effective configuration
    Show,

    /// Write a commented default configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::parse_from(["switchyard", "serve"]);
        match cli.command {
            Commands::Serve { no_producer } => assert!(!no_producer),
            _ => panic!("Expected Serve command"),
        }
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["switchyard", "worker", "--index", "1", "--config", "/tmp/s.toml"]);
        assert_eq!(cli.config.as_deref(), Some("/tmp/s.toml"));
        match cli.command {
            Commands::Worker { index } => assert_eq!(index, Some(1)),
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_demo_scenario() {
        let cli = Cli::parse_from(["switchyard", "demo", "round-robin", "--workers", "3"]);
        match cli.command {
            Commands::Demo {
                scenario, workers, requests, ..
            } => {
                assert_eq!(scenario, DemoScenario::RoundRobin);
                assert_eq!(workers, 3);
                assert_eq!(requests, 10);
            }
            _ => panic!("Expected Demo command"),
        }
    }

    #[test]
    fn test_reply_server_delay_options() {
        let cli = Cli::parse_from(["switchyard", "reply-server", "--delay-first-n", "2", "--delay-ms", "1500"]);
        match cli.command {
            Commands::ReplyServer {
                bind,
                delay_first_n,
                delay_ms,
            } => {
                assert!(bind.is_none());
                assert_eq!(delay_first_n, 2);
                assert_eq!(delay_ms, 1500);
            }
            _ => panic!("Expected ReplyServer command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["switchyard", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_config_init_force() {
        let cli = Cli::parse_from(["switchyard", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }
}
