//! Fuzzmill core library: the fuzzing pipeline stages, the durable session
//! store, and the configuration they share.

mod arggen;
mod config;
mod data;
mod error;
mod manage;
mod monitor;
mod mutate;
mod resultproc;
mod seeds;
mod session;

pub use arggen::*;
pub use config::*;
pub use data::*;
pub use error::*;
pub use manage::*;
pub use monitor::*;
pub use mutate::*;
pub use resultproc::*;
pub use seeds::*;
pub use session::*;
