//! Keyledger Types
//!
//! Shared data model for keys, key versions, envelopes, grants and audit
//! records. These are the shapes the transport layer, the scheduler and the
//! core engines exchange.

pub mod audit;
pub mod envelope;
pub mod error;
pub mod grants;
pub mod keys;

pub use audit::*;
pub use envelope::*;
pub use error::*;
pub use grants::*;
pub use keys::*;
