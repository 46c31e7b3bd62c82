//! HTTP surface: login endpoints, session endpoints and the authorizing
//! reverse proxy.

pub mod cookies;
pub mod policy;
pub mod proxy;
pub mod request;
mod router;
mod server;

pub use policy::{Policy, PolicyEngine};
pub use proxy::Forwarder;
pub use router::{AppState, create_router};
pub use server::Gateway;
