//! The `session` module holds per-client state whose lifetime is bounded by
//! the client's session: the resolved [`ClientIdentity`] and the
//! [`ConnectContext`] captured at connect time.
//!
//! Both stores are plain `Arc`-shared maps keyed by client id. Registering a
//! store as an [`EngineHook`](crate::broker::EngineHook) on the embedded
//! broker makes it fill itself on connect and forget the client on
//! disconnect.

pub mod connect_context;
pub mod identity;

pub use connect_context::{ConnectContext, ConnectContextStore};
pub use identity::{ClientIdentity, IdentityResolver, IdentityStore};
