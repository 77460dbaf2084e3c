//! Protocol envelope, correlation, and data types.
//!
//! Everything transport-independent about the wire protocol lives here:
//! - JSON-RPC 2.0 envelope encoding and inbound classification
//! - the pending-request table matching out-of-order replies by id
//! - a line-delimited session driver usable over any stream pair
//! - tool discovery / invocation / initialize payload types

pub mod envelope;
pub mod pending;
pub mod session;
pub mod types;

pub use envelope::{Envelope, JsonRpcError, JsonRpcNotification, JsonRpcRequest, RequestId};
pub use pending::{PendingRequests, RpcFailure};
pub use session::{RequestError, RpcSession};
