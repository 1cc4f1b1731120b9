//! This crate defines the core types and traits used to snapshot the state of a running chain
//! and rehydrate it into a forked genesis.
//! It specifies the interfaces which allow the same snapshot pipeline to run against a live
//! node over RPC or against an in-memory store in tests.

#![deny(missing_docs)]

mod storage;
pub use storage::*;

mod services;
pub use services::*;

#[cfg(feature = "mocks")]
pub mod mocks;
