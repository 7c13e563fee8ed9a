//! Network path shared by the strategy router, the sync queue and the
//! upcoming-events source.

mod client;
#[cfg(test)]
pub mod testing;
mod types;

pub use client::{HttpNetwork, Network, NetworkError};
pub use types::{Request, Response, ResponseSource, IDEMPOTENCY_HEADER};
