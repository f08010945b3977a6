// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Switchyard queue layer.
//!
//! This crate holds everything the polling agent needs from a message queue,
//! without committing to a particular broker:
//!
//! - [`QueueTransport`] / [`QueueConnector`]: receive, delete and release
//!   messages on a queue reached through temporary credentials.
//! - [`Consumer`]: the managed consume loop. It receives batches, dispatches
//!   each message to a [`MessageHandler`] concurrently, deletes handled
//!   messages and reports lifecycle signals ([`ConsumerEvent`]).
//! - [`MemoryQueue`]: an in-process broker with visibility timeouts,
//!   credential expiry and failure injection, for tests and local runs.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchyard_queue::{Consumer, ConsumerConfig, MemoryQueue};
//!
//! let queue = Arc::new(MemoryQueue::new());
//! let consumer = Arc::new(Consumer::new(queue.clone(), handler, ConsumerConfig::default()));
//! consumer.start()?;
//! consumer.wait_until_polling(Duration::from_secs(5)).await?;
//!
//! queue.send("hello");
//!
//! consumer.stop();
//! consumer.wait_until_stopped(Duration::from_secs(5)).await?;
//! ```

mod consumer;
mod error;
mod memory;
mod message;
mod transport;

pub use consumer::{
    Consumer, ConsumerConfig, ConsumerEvent, ConsumerStatus, HandlerError, MAX_BATCH_SIZE,
    MessageHandler,
};
pub use error::{QueueError, Result};
pub use memory::{MemoryConnection, MemoryConnector, MemoryQueue};
pub use message::{QueueCredentials, QueueEndpoint, QueueMessage};
pub use transport::{QueueConnector, QueueTransport};
