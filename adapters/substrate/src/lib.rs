//! Adapters connecting the fork pipeline to a Substrate-style node: a JSON-RPC storage query
//! service and a file-backed subsystem list.

#![deny(missing_docs)]

mod rpc;
mod subsystems;

pub use rpc::{RpcConfig, RpcError, SubstrateRpcService};
pub use subsystems::{SubsystemFileError, SubsystemListFile};
