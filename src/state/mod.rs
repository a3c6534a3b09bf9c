//! Per-user session state.
//!
//! Every read and write of a user's task state goes through
//! [`SessionStateStore`], one lock per user.

mod store;

pub(crate) use store::CancelTargets;
pub use store::{SessionStateStore, UserSession};
