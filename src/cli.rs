use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "restream", version, about = "Live stream re-publishing supervisor")]
pub struct Cli {
    /// Path to config file (overrides ./restream.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory shared with the distribution server
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Base sink address the worker publishes to (e.g. rtmp://host:1935/live)
    #[arg(long, global = true)]
    pub sink_base: Option<String>,

    /// Stream catalogue file
    #[arg(long, global = true)]
    pub streams: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Supervise streams until interrupted
    Run {
        /// Stream id to start (repeatable; defaults to every catalogued stream)
        #[arg(short = 's', long = "stream")]
        ids: Vec<String>,

        /// Seconds between status reports
        #[arg(long, default_value_t = 30)]
        report_every: u64,
    },
    /// Verify the output directory and probe the distribution server
    Check {
        /// Also probe this stream's playlist URL
        #[arg(short, long)]
        stream: Option<String>,
    },
    /// Kill worker processes left behind for a stream whose handle was lost
    Reclaim {
        /// Stream id
        id: String,
    },
    /// Delete every output artifact for a stream
    Purge {
        /// Stream id
        id: String,
    },
}
