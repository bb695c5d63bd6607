pub mod config;
pub mod event;
pub mod executor;
pub mod failure;
pub mod format;
pub mod process;
pub mod queue;
pub mod runlog;
pub mod scheduler;
pub mod semaphore;
pub mod server;
pub mod stash;
pub mod state;
pub mod supervisor;
pub mod taskfile;
pub mod taskrunner;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate log;

#[macro_use]
extern crate scopeguard;
