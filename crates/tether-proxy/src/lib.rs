//! Edge-resident proxy in front of a cluster API server.
//!
//! While the upstream answers its liveness probe, requests are forwarded and
//! list responses are filtered or cached according to the `type=...` token in
//! their label selector. When it stops answering, reads are served from the
//! durable cache and writes are refused.

pub mod body;
pub mod cache;
pub mod classify;
pub mod config;
pub mod decompress;
pub mod error;
pub mod filter;
pub mod handler;
pub mod health;
pub mod local;
pub mod metrics;
pub mod remote;
pub mod state;
pub mod tee;
pub mod transport;

pub use cache::{CacheKey, CacheManager, QueryClass};
pub use classify::{PolicyClass, RequestInfo, Verb};
pub use config::{HandlerKind, ProxyConfig, UpstreamTarget};
pub use error::ProxyError;
pub use handler::{build_router, EdgeHandler};
pub use health::HealthChecker;
pub use state::AppState;
pub use transport::{Forwarder, ReqwestTransport, RoundTripper};
