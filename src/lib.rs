//! Job execution core of a parallel tool for manipulating objects in an
//! S3-compatible store and files on the local filesystem.
//!
//! A parsed command becomes a [`Job`]; the [`WorkerPool`] runs it through
//! the operation dispatcher. Listing-shaped commands fan out into sub-jobs
//! through [`wild::wild_operation`], which tracks their completion and rolls
//! their results up into the parent's shared [`job::Counters`].
//!
//! The command grammar, the process signal wiring, and the production
//! object-store transport live outside this crate; the seams they plug into
//! are [`Job`] construction, [`store::ObjectStore`], and the exit callback
//! on [`worker::WorkerParams`].

pub mod arg;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod list;
pub mod op;
pub mod opt;
pub mod stats;
pub mod store;
pub mod url;
pub mod wild;
pub mod worker;

pub use arg::JobArg;
pub use config::PoolConfig;
pub use error::{AcceptableError, JobError};
pub use job::{Counters, Job};
pub use op::Operation;
pub use opt::{Opt, OptionList};
pub use stats::{StatCategory, Stats};
pub use store::{MemoryStore, ObjectStore, StorageClass};
pub use url::S3Url;
pub use worker::{JobQueue, WorkerParams, WorkerPool};

/// Initializes the logger sink. Verbosity maps the usual way:
/// 0=ERROR, 1=INFO, 2=DEBUG, 3+=TRACE; quiet wins over everything.
/// `RUST_LOG` overrides when set.
pub fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "off"
    } else {
        match verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
