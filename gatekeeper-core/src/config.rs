//! dhcp server configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default dhcpv4 addr
    pub static DEFAULT_V4_ADDR: &str = "0.0.0.0:67"; // default dhcpv4 port is 67
    /// Default registry timeout (seconds). Every call into the record store must
    /// complete within this window or the transaction is abandoned
    pub const DEFAULT_REGISTRY_TIMEOUT: u64 = 3;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "gatekeeper-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/gatekeeper/config.yaml";
    /// default records database path, `memory` keeps records in memory only
    pub const DEFAULT_DATABASE_URL: &str = "/var/lib/gatekeeper/records.db";
    /// default log level. Can use this argument or GATEKEEPER_LOG env var
    pub const DEFAULT_GATEKEEPER_LOG: &str = "info";

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;
    use dhcproto::v4;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "gatekeeper", bin_name = "gatekeeper", about, long_about = None)]
    /// parses from cli & environment var. gatekeeper will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to the network config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the v4 address to listen on
        #[clap(long, env, value_parser, default_value = DEFAULT_V4_ADDR)]
        pub v4_addr: SocketAddr,
        /// deadline for a single record store call (seconds)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REGISTRY_TIMEOUT)]
        pub registry_timeout: u64,
        /// number of tokio worker threads, defaults to # of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_GATEKEEPER_LOG)]
        pub gatekeeper_log: String,
        /// Path to the records database, use "memory" to keep records in memory
        #[clap(short, long, env, value_parser, default_value = DEFAULT_DATABASE_URL)]
        pub database_url: String,
    }

    impl Config {
        /// registry timeout as `Duration`
        pub fn registry_timeout(&self) -> Duration {
            Duration::from_secs(self.registry_timeout)
        }

        /// are we bound to the default dhcpv4 port?
        pub fn is_default_port_v4(&self) -> bool {
            self.v4_addr.port() == v4::SERVER_PORT
        }

        /// should records be kept in memory only
        pub fn in_memory(&self) -> bool {
            self.database_url == "memory"
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for logging
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// install the global subscriber. `log_filter` accepts anything
        /// `RUST_LOG` would, falling back to `info`
        pub fn parse(log_filter: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;

            let filter = EnvFilter::try_new(log_filter)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("sqlx=warn".parse()?);

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
