/// Access management module
///
/// Invite grants (short-lived 6-digit codes) and the workflow entitlements they
/// turn into once redeemed.

pub mod ledger;
pub mod storage;
pub mod store;
pub mod types;

pub use ledger::AccessLedger;
pub use storage::GrantStorage;
pub use store::AccessGrantStore;
pub use types::{AccessEntitlement, Identity, InviteGrant, UserRole};
