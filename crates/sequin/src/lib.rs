//! Sequin: a per-thread run-to-completion task scheduler
//!
//! Each thread owns at most one [`TaskLoop`]; cloneable [`TaskRunner`]
//! handles post closures to it from any thread. Tasks run one at a
//! time, in posting order, optionally delayed, and never migrate off
//! the loop's thread.
//!
//! The crate is organized around four pieces:
//! - **Tasks**: closures plus scheduling metadata (`Task`, `PendingTask`)
//! - **Posting**: the cross-thread ingress path (`TaskRunner`)
//! - **Driving**: the pump contract and default pump (`Pump`, `PumpDefault`)
//! - **Sessions**: running and quitting the loop, including nested
//!   sessions (`RunLoop`, `QuitHandle`)
//!
//! # Example
//!
//! ```rust,ignore
//! use sequin::{RunLoop, TaskLoop};
//!
//! let task_loop = TaskLoop::new();
//! let runner = task_loop.task_runner();
//!
//! let mut run_loop = RunLoop::new();
//! let quit = run_loop.quit_handle();
//! runner.post(move || {
//!     println!("running on the loop thread");
//!     quit.quit();
//! });
//! run_loop.run();
//! ```
//!
//! For a scheduler on its own thread, see [`LoopThread`].

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod ingress;
mod observer;
mod pump;
mod run_loop;
mod runner;
mod task;
mod task_loop;
mod thread;
mod time;

// Tasks and cancellation
pub use task::{CancelHandle, PendingTask, Task};

// Posting
pub use runner::TaskRunner;

// Driving
pub use pump::{Pump, PumpDefault, PumpDelegate, TimerSlack};

// The scheduler core
pub use task_loop::TaskLoop;

// Sessions
pub use run_loop::{QuitHandle, RunLoop, RunLoopType};

// Observers
pub use observer::{DestructionObserver, TaskObserver};

// Owned scheduler threads
pub use thread::{LoopThread, SpawnError};

// Timer introspection
pub use time::high_resolution_timer_in_use;
