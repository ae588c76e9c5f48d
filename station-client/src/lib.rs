//! Client SDK for a partitioned, durable pub/sub broker.
//!
//! A station is a logical topic split into partitions. Producers route
//! messages round-robin across a station's partitions, either synchronously
//! or through a bounded in-memory queue drained by a background task.
//! Consumers subscribe every partition under one durable group and either
//! pull batches on demand ([`BatchConsumer`]) or run one polling loop per
//! partition that pushes batches into a callback ([`CallbackConsumer`]).
//!
//! Connection bootstrap, auth, and the wire protocol live behind the
//! [`transport::BrokerTransport`] trait and are not part of this crate.

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
mod naming;
pub mod producer;
pub mod transport;

pub use client::StationClient;
pub use config::{ClientOptions, ConsumerOptions, ProducerOptions, StartPolicy};
pub use consumer::{BatchConsumer, CallbackConsumer};
pub use message::ConsumedMessage;
pub use producer::Producer;
