//! Agent collaborator traits.
//!
//! The scheduler talks to agents only through these traits: the TCP client in
//! [`crate::transport`] implements them for a real cluster and
//! [`crate::local::LocalCluster`] implements them in-process.

use async_trait::async_trait;
use std::collections::HashMap;

use super::DispatchError;
use crate::market::AgentLocation;
use crate::plan::TaskGroupId;
use crate::protocol::{DeleteOutputRequest, ProgressEvent, TaskGroupRequest};

#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(
        &self,
        location: &AgentLocation,
    ) -> Result<Box<dyn AgentSession>, DispatchError>;
}

/// One conversation with an agent
#[async_trait]
pub trait AgentSession: Send {
    /// Files the agent already holds, name to version
    async fn file_inventory(&mut self) -> Result<HashMap<String, String>, DispatchError>;

    async fn ship_file(
        &mut self,
        name: &str,
        version: &str,
        contents: Vec<u8>,
    ) -> Result<(), DispatchError>;

    /// Start a task group. Progress follows through [`AgentSession::next_event`].
    async fn execute(&mut self, request: TaskGroupRequest) -> Result<(), DispatchError>;

    /// Next progress event; `None` when the agent closed the stream
    async fn next_event(&mut self) -> Result<Option<ProgressEvent>, DispatchError>;

    async fn abort(&mut self, task_group_id: TaskGroupId) -> Result<(), DispatchError>;

    async fn delete_output(&mut self, request: DeleteOutputRequest) -> Result<(), DispatchError>;
}
