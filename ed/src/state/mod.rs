//! Store access with actor pattern
//!
//! StoreManager owns the Store and processes messages via channels,
//! providing serialized access to persistent state.

mod manager;
mod messages;

pub use manager::StoreManager;
pub use messages::{StoreCommand, StoreError, StoreResponse};
