//! # msgrelay
//!
//! `msgrelay` accepts messages over HTTP, enqueues them on a durable
//! RabbitMQ queue and processes them asynchronously with a worker that
//! appends each one to a log before acknowledging it.
//!
//! ## Core Modules
//!
//! - `broker`: connection traits, the RabbitMQ client and the message types.
//! - `publisher`: publishes one message per call on its own connection.
//! - `supervisor`: bounded fixed-delay retry around connection attempts.
//! - `consumer`: the long-running worker loop (prefetch 1, ack after append).
//! - `sink`: the append-only log of processed messages.
//! - `api`: the HTTP endpoints in front of the publisher.
//! - `config`: loading settings from files and the environment.
//! - `utils`: the shared error type and logging setup.

pub mod api;
pub mod broker;
pub mod config;
pub mod consumer;
pub mod publisher;
pub mod sink;
pub mod supervisor;
pub mod utils;
