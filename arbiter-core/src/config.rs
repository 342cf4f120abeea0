//! arbiter process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default external api, serves `/check` as well as health & metrics
    pub static DEFAULT_EXTERNAL_API: &str = "[::]:12345";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "vip-arbiter-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/vip-arbiter/config.yaml";
    /// default log level. Can use this argument or ARBITER_LOG env var
    pub const DEFAULT_ARBITER_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";

    use std::{net::SocketAddr, path::PathBuf};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, version, name = "vip-arbiter", bin_name = "vip-arbiter", about, long_about = None)]
    /// parses from cli & environment var. `.env` in the working dir is loaded as well
    pub struct Config {
        /// path to the arbiter's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address the decision endpoint and diagnostics listen on
        #[clap(long, env, value_parser, default_value = DEFAULT_EXTERNAL_API)]
        pub external_api: SocketAddr,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of worker threads, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long = "log", env = "ARBITER_LOG", value_parser, default_value = DEFAULT_ARBITER_LOG)]
        pub arbiter_log: String,
        /// "standard", "json" or "pretty"
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        /// print the supported health check names and exit
        #[clap(long, action)]
        pub support: bool,
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

    /// Installed logging configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting applied to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. `arbiter_log` is an `EnvFilter`
        /// directive, `log_frmt` one of "json", "pretty" or "standard"
        pub fn parse(arbiter_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(arbiter_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?)
                .add_directive("h2=off".parse()?)
                .add_directive("tower=off".parse()?);

            match log_frmt {
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

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
