pub mod algorithms;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod membership;
pub mod metrics;
pub mod middleware;
pub mod peer_client;
pub mod picker;
pub mod server;
pub mod types;
pub mod validation;

pub use config::{Behaviors, Config};
pub use error::{ThrottlerError, ThrottlerResult};
pub use membership::{Coordinator, PeerSyncer, StaticPeerSyncer};
pub use picker::{ConsistentHash, PeerPicker};
pub use server::{create_app, Server, ServerDeps};
