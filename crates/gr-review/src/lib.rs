//! The review state machine: pending → in_review → approved/rejected →
//! delivered, with idempotent transitions and a per-user in-review guard.

pub mod machine;
pub mod store;

pub use machine::{ApproveRequest, Outcome};
pub use store::{InMemoryReviewStore, PgReviewStore, ReviewStore};
