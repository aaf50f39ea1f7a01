//! HTTP Adapters
//!
//! reqwest-backed implementations of the REST ports: a raw transport used by
//! the authenticated requester, and the token refresh client.

mod refresh;
mod transport;

pub use refresh::HttpRefreshClient;
pub use transport::ReqwestTransport;
