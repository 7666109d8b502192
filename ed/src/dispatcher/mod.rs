//! Round-robin dispatcher
//!
//! A single loop owns an immutable snapshot of the active task groups,
//! replaces it on every refresh tick, and answers selection requests from it
//! without touching the store.

mod core;
mod messages;

pub use core::{Dispatcher, DispatcherHandle};
pub use messages::{DispatchRequest, Selection, Snapshot};
