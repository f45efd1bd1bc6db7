//! Cluster Protocol
//!
//! Messages exchanged with the master and with agents. Every message travels in
//! an [`Envelope`] carrying a unique message ID and, for replies, the ID of the
//! request it answers. On the wire each envelope is one JSON object per line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::market::{BidSummary, Offer};
use crate::plan::{DatasetId, StepGroupId, StepId, Task, TaskGroupId};
use crate::status::FlowExecutionStatus;

/// Routing wrapper for every protocol message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub message_id: String,
    /// Set on replies: the `message_id` being answered
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(payload: P) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Build a reply correlated to this message
    pub fn reply<R>(&self, payload: R) -> Envelope<R> {
        Envelope {
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Some(self.message_id.clone()),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn is_reply_to<Q>(&self, request: &Envelope<Q>) -> bool {
        self.correlation_id.as_deref() == Some(request.message_id.as_str())
    }
}

/// Driver to master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MasterRequest {
    /// Ask for offers that could satisfy the outstanding demand
    ListOffers { demand: Vec<BidSummary> },
    /// Turn this connection into a status stream for one job
    OpenStatusStream { job_id: u32 },
    /// One status snapshot on an open stream
    FlowStatus { status: FlowExecutionStatus },
}

/// Master to driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum MasterResponse {
    Offers { offers: Vec<Offer> },
    StreamOpened { job_id: u32 },
    Error { message: String },
}

/// Everything an agent needs to run one task group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupRequest {
    pub job_id: u32,
    pub task_group_id: TaskGroupId,
    pub step_group_id: StepGroupId,
    pub tasks: Vec<Task>,
    pub memory_mb: u64,
    /// Names of files the agent was told to hold
    pub required_files: Vec<String>,
    pub driver_host: String,
    pub driver_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutputRequest {
    pub job_id: u32,
    pub task_group_id: TaskGroupId,
    pub dataset_ids: Vec<DatasetId>,
}

/// Driver to agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AgentRequest {
    FileInventory,
    ShipFile {
        name: String,
        version: String,
        contents: Vec<u8>,
    },
    ExecuteTaskGroup { request: TaskGroupRequest },
    Abort { task_group_id: TaskGroupId },
    DeleteOutput(DeleteOutputRequest),
}

/// Progress reported while a task group runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepStarted { step_id: StepId },
    StepCompleted { step_id: StepId },
    StepFailed { step_id: StepId, error: String },
    GroupCompleted,
}

/// Agent to driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AgentResponse {
    /// File name to version
    Inventory { files: HashMap<String, String> },
    FileStored { name: String },
    Progress(ProgressEvent),
    Deleted { task_group_id: TaskGroupId },
    Ack,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_is_correlated() {
        let request = Envelope::new(AgentRequest::FileInventory);
        let reply = request.reply(AgentResponse::Ack);
        assert!(reply.is_reply_to(&request));
        assert_ne!(reply.message_id, request.message_id);
        assert!(request.correlation_id.is_none());
    }

    #[test]
    fn messages_are_tagged() {
        let event = AgentResponse::Progress(ProgressEvent::StepFailed {
            step_id: 4,
            error: "disk full".to_string(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Progress");
        assert_eq!(json["data"]["event"], "step_failed");
        assert_eq!(json["data"]["step_id"], 4);

        let request = MasterRequest::OpenStatusStream { job_id: 9 };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"type":"OpenStatusStream","data":{"job_id":9}}"#);
    }

    #[test]
    fn unit_variants_parse_without_data() {
        let parsed: AgentRequest = serde_json::from_str(r#"{"type":"FileInventory"}"#).unwrap();
        assert_eq!(parsed, AgentRequest::FileInventory);
    }
}
