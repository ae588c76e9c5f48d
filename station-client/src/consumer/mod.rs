//! Consumer side: per-partition subscriptions with keep-alive heartbeats,
//! aggregated either synchronously ([`BatchConsumer`]) or through
//! independent polling loops ([`CallbackConsumer`]).

mod batch;
mod callback;
pub(crate) mod keepalive;
pub(crate) mod subscription;

pub use batch::BatchConsumer;
pub use callback::{BatchCallback, CallbackConsumer};
