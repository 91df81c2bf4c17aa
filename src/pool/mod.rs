//! Pool module - resolver workers and shutdown signalling.

mod shutdown;
mod worker;

pub use shutdown::*;
pub use worker::*;
