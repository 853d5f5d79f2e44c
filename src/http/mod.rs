pub mod latency;
pub mod transport;

#[cfg(test)]
pub(crate) mod fake;

pub use latency::LatencyStats;
pub use transport::{HttpResponse, Query, ReqwestTransport, Transport, TransportError};
