//! Lookup client module.

mod http;
mod lookup;
mod rate_limiter;
mod resolver;

pub use http::*;
pub use lookup::*;
pub use rate_limiter::*;
pub use resolver::*;
