//! Dispatcher messages

use std::sync::Arc;

use encorestore::{TaskDefinition, TaskGroup};
use tokio::sync::oneshot;

use crate::state::StoreResponse;

/// Task groups as of one refresh
///
/// Replaced wholesale on refresh, never mutated in place.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub generation: u64,
    pub groups: Arc<[TaskGroup]>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            generation: 0,
            groups: Arc::from(Vec::new()),
        }
    }
}

/// A task chosen for one request, with the schedule it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub schedule_id: i64,
    pub task: TaskDefinition,
}

/// Requests handled by the dispatcher loop
#[derive(Debug)]
pub enum DispatchRequest {
    /// Next task in round-robin order; `None` when no group is available
    Select {
        reply: oneshot::Sender<Option<Selection>>,
    },

    /// Refresh immediately, replying with the number of groups
    Refresh {
        reply: oneshot::Sender<StoreResponse<usize>>,
    },

    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },

    Shutdown,
}
