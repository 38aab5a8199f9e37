//! Commander override service: authenticated manual changes to signals,
//! risk state and module flags. Every request, granted or denied, lands in
//! the audit ledger.

pub mod auth;
pub mod service;

pub use auth::{Authorizer, HmacAuthorizer, OverrideAction, OverrideRequest, StaticAuthorizer};
pub use service::{spawn_commander, CommanderDeps, CommanderHandle, OverrideService, PendingSignals};
