#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod coverage;
pub mod error;
pub mod genetics;
pub mod net;
pub mod packet;
pub mod protocols;
pub mod recorder;
pub mod rng;
pub mod session;
pub mod target;
pub mod testcase;
pub mod transition;

pub(crate) mod utils;

pub use error::{Error, Result};
pub use utils::hexdump;
