//! The silence protocol: per-user admission control that diverts inbound
//! messages to quarantine instead of spending AI budget on them.

pub mod manager;
pub mod store;

pub use manager::{Divert, ProtocolManager, ProtocolStats};
pub use store::{InMemoryProtocolStore, PgProtocolStore, ProtocolStore, QuarantineTotals};
