//! Reverse proxy functionality
//!
//! Backend pool and health probing, backend selection, client
//! identification, upstream forwarding and the dispatcher tying them
//! together.

pub mod backend;
pub mod client_id;
pub mod dispatcher;
pub mod health;
pub mod selector;
pub mod upstream;

pub use backend::{Backend, BackendPool};
pub use dispatcher::Dispatcher;
pub use health::HealthMonitor;
pub use selector::{BackendSelector, RoundRobin};
pub use upstream::UpstreamClient;
