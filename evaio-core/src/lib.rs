//! # evaio
//!
//! Linux native AIO completion backend for reactor-style event loops.
//!
//! Read and write requests are batched into `io_submit`, the kernel signals
//! completion through a single eventfd, and the drain loop turns completion
//! records into callback activations on the host reactor.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐ enqueue  ┌──────────────────────────────┐
//! │  producers   │─────────►│  OpTable  (RwLock)           │
//! │ AioSubmitter │          │  ┌────────┐  ┌─────────────┐ │
//! └──────────────┘          │  │ arena  │  │pending queue│ │
//!                           │  └────────┘  └─────────────┘ │
//!                           └──────────────┬───────────────┘
//!                                          │ submit (batches of N - in_flight)
//!                                          ▼
//! ┌──────────────┐ readable ┌──────────────────────────────┐
//! │   Reactor    │◄─────────│  Kernel (io_submit ...)      │
//! │ watch/activate          │  signals eventfd per request │
//! └──────┬───────┘          └──────────────────────────────┘
//!        │ on_notify: io_getevents, resolve, activate
//!        ▼
//!   dispatch(op) -> callback(&Completion)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use evaio::{AioConfig, AioContext, AioOp, LocalReactor};
//!
//! let reactor = LocalReactor::new();
//! let mut ctx = AioContext::new(&AioConfig::from_env(), reactor)?;
//!
//! let mut op = AioOp::new(|done| println!("read {} bytes", done.result));
//! op.prepare_read(file.as_raw_fd(), vec![0; 4096], 4096, 0, 0)?;
//! let handle = ctx.enqueue(op)?;
//!
//! while ctx.state(handle) != Some(evaio::OpState::Completed) {
//!     ctx.run_once(std::time::Duration::from_millis(10))?;
//! }
//! let op = ctx.release(handle)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(not(target_os = "linux"))]
compile_error!("evaio requires Linux native AIO (io_setup/io_submit/io_getevents)");

pub mod abi;
pub mod arena;
pub mod cancel;
pub mod config;
pub mod context;
pub mod drain;
pub mod error;
pub mod kernel;
pub mod logging;
pub mod notify;
pub mod op;
mod queue;
pub mod reactor;
pub mod sim;
pub mod stats;
pub mod submit;
mod table;

pub use cancel::CancelOutcome;
pub use config::{AioConfig, AioConfigBuilder, ConfigError, LogConfig, LogFormat, LogLevel};
pub use context::AioContext;
pub use drain::DrainReport;
pub use error::AioError;
pub use kernel::{Kernel, LinuxAio};
pub use notify::EventFd;
pub use op::{AioCallback, AioOp, Completion, OpHandle, OpKind, OpState};
pub use reactor::{Activation, EventKind, LocalReactor, Reactor, TurnReport, WatchToken};
pub use sim::SimKernel;
pub use stats::{AioStats, StatsSnapshot};
pub use submit::SubmitReport;
pub use table::AioSubmitter;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
