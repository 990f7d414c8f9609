//! Session consistency bookkeeping: session tokens, the per-client token store, and consistency
//! levels.

pub mod consistency;
pub mod error;
pub mod metrics_consts;
pub mod store;
pub mod token;

pub use consistency::{ConsistencyLevel, ConsistencyViolation};
pub use error::SessionTokenError;
pub use store::{SessionTokenStore, TokenScope};
pub use token::{format_session_header, parse_session_header, SessionToken};
