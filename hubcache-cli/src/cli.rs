use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Pilet cache inspection and maintenance tool",
    long_about = "Loads, preloads and inspects the pilet bundles cached by a MainHub shell.\n\
                  \n\
                  Settings are read from HUBCACHE_* environment variables (a .env file in the\n\
                  working directory is honored) and can be overridden by the flags below."
)]
pub struct CliArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Directory of the persistent store
    #[arg(long, global = true, help = "Directory holding cached pilet bundles")]
    pub cache_dir: Option<PathBuf>,

    /// Retrieval strategy
    #[arg(
        short,
        long,
        global = true,
        help = "Retrieval strategy: cache-first, network-first, cache-only, network-only, stale-while-revalidate, network-first-timeout"
    )]
    pub strategy: Option<String>,

    /// Pilet feed URL
    #[arg(long, global = true, help = "URL of the pilet feed service")]
    pub feed_url: Option<String>,

    /// Disable critical pilet preloading
    #[arg(long, global = true, help = "Disable preloading of critical pilets")]
    pub no_preload: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load a pilet through the active strategy
    Load {
        /// Pilet name
        name: String,

        /// Pin a version; required when no feed is configured
        #[arg(long = "pilet-version")]
        version: Option<String>,

        /// Bundle URL, used when no feed is configured
        #[arg(long)]
        link: Option<String>,

        /// Write the bundle to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Preload the critical pilets listed by the feed
    Preload,

    /// Print store and strategy statistics
    Stats,

    /// Run the cache health check
    Health,

    /// Export performance metrics as JSON
    Metrics,

    /// Remove stale, non-critical entries
    Optimize,

    /// Remove every cached version of a pilet, or one version
    Invalidate {
        name: String,

        #[arg(long = "pilet-version")]
        version: Option<String>,
    },

    /// Remove every cached pilet
    Clear,

    /// Show how the interception layer would treat a request
    Route {
        url: String,

        #[arg(short, long, default_value = "GET")]
        method: String,
    },
}
