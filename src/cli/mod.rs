//! CLI command definitions

use crate::config::AppConfig;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "solace")]
#[command(about = "Therapy-chat backend with a warm conversation pool", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the transcript database (defaults to ~/.solace/solace.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Number of warm conversation handles to keep
        #[arg(long)]
        pool_size: Option<usize>,

        /// Seconds between pool maintenance passes
        #[arg(long)]
        maintenance_secs: Option<u64>,

        /// Give up waiting for an assistant reply after this many seconds
        #[arg(long)]
        run_timeout_secs: Option<u64>,
    },

    /// Print a session's messages
    History {
        /// Session ID
        session: String,
    },

    /// Delete a session's messages and forget its conversation
    Clear {
        /// Session ID
        session: String,
    },
}

impl Cli {
    /// Layer command-line flags over `config`.
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }

        if let Commands::Serve {
            bind,
            pool_size,
            maintenance_secs,
            run_timeout_secs,
        } = &self.command
        {
            if let Some(bind) = bind {
                config.bind_addr = *bind;
            }
            if let Some(size) = pool_size {
                config.pool_target = *size;
            }
            if let Some(secs) = maintenance_secs {
                config.maintenance_period = Duration::from_secs(*secs);
            }
            if let Some(secs) = run_timeout_secs {
                config.poll.timeout = Duration::from_secs(*secs);
            }
        }
    }
}
