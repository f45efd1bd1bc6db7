//! # TCP Transport
//!
//! Newline-delimited JSON over TCP. [`JsonLineConnection`] frames
//! [`Envelope`]s one per line, and [`TcpClusterClient`] uses it to implement
//! the collaborator traits the driver depends on:
//!
//! - [`OfferSource`]: one short-lived master connection per matching round
//! - [`StatusStreamConnector`]: a long-lived master connection per run
//! - [`AgentConnector`]: one connection per dispatched task group

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::market::{AgentLocation, BidSummary, MarketError, Offer, OfferSource};
use crate::plan::TaskGroupId;
use crate::protocol::{
    AgentRequest, AgentResponse, DeleteOutputRequest, Envelope, MasterRequest, MasterResponse,
    ProgressEvent, TaskGroupRequest,
};
use crate::reporter::{StatusStream, StatusStreamConnector};
use crate::scheduler::agent::{AgentConnector, AgentSession};
use crate::scheduler::DispatchError;
use crate::status::FlowExecutionStatus;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {addr}")]
    Timeout { addr: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// One TCP connection carrying one JSON envelope per line
#[derive(Debug)]
pub struct JsonLineConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: String,
}

impl JsonLineConnection {
    pub async fn connect(addr: &str, connect_timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout {
                addr: addr.to_string(),
            })?
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        debug!(peer = %addr, "🔌 TRANSPORT: Connected");
        Ok(Self::from_stream(stream, addr))
    }

    pub fn from_stream(stream: TcpStream, peer: &str) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            peer: peer.to_string(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next message, or `None` once the peer closed the connection
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        trace!(peer = %self.peer, bytes = line.len(), "🔌 TRANSPORT: Received line");
        Ok(Some(serde_json::from_str(line.trim_end())?))
    }

    /// Send a request envelope and wait for the reply correlated to it
    pub async fn request<Req, Resp>(&mut self, payload: Req) -> Result<Resp, TransportError>
    where
        Req: Serialize + Send,
        Resp: DeserializeOwned,
    {
        let request = Envelope::new(payload);
        self.send(&request).await?;
        loop {
            let reply: Envelope<Resp> = self.recv().await?.ok_or(TransportError::Closed)?;
            if reply.is_reply_to(&request) {
                return Ok(reply.payload);
            }
            trace!(peer = %self.peer, "🔌 TRANSPORT: Skipping uncorrelated message");
        }
    }

    pub async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// TCP implementation of every cluster collaborator
#[derive(Debug, Clone)]
pub struct TcpClusterClient {
    master: String,
    connect_timeout: Duration,
}

impl TcpClusterClient {
    pub fn new(master: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            master: master.into(),
            connect_timeout,
        }
    }

    async fn master_connection(&self) -> Result<JsonLineConnection, TransportError> {
        JsonLineConnection::connect(&self.master, self.connect_timeout).await
    }

    async fn list_offers(&self, demand: &[BidSummary]) -> Result<Vec<Offer>, TransportError> {
        let mut connection = self.master_connection().await?;
        let request = MasterRequest::ListOffers {
            demand: demand.to_vec(),
        };
        match connection.request::<_, MasterResponse>(request).await? {
            MasterResponse::Offers { offers } => Ok(offers),
            MasterResponse::Error { message } => Err(TransportError::Remote(message)),
            other => Err(TransportError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

#[async_trait]
impl OfferSource for TcpClusterClient {
    async fn fetch_offers(&self, demand: &[BidSummary]) -> Result<Vec<Offer>, MarketError> {
        self.list_offers(demand)
            .await
            .map_err(|e| MarketError::OfferFetch(e.to_string()))
    }
}

#[async_trait]
impl StatusStreamConnector for TcpClusterClient {
    async fn open(&self, job_id: u32) -> Result<Box<dyn StatusStream>, TransportError> {
        let mut connection = self.master_connection().await?;
        let reply = tokio::time::timeout(
            self.connect_timeout,
            connection.request::<_, MasterResponse>(MasterRequest::OpenStatusStream { job_id }),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            addr: self.master.clone(),
        })??;
        match reply {
            MasterResponse::StreamOpened { .. } => Ok(Box::new(TcpStatusStream { connection })),
            MasterResponse::Error { message } => Err(TransportError::Remote(message)),
            other => Err(TransportError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

/// Status snapshots streamed to the master on one connection
#[derive(Debug)]
pub struct TcpStatusStream {
    connection: JsonLineConnection,
}

#[async_trait]
impl StatusStream for TcpStatusStream {
    async fn send(&mut self, status: &FlowExecutionStatus) -> Result<(), TransportError> {
        self.connection
            .send(&Envelope::new(MasterRequest::FlowStatus {
                status: status.clone(),
            }))
            .await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connection.shutdown().await
    }
}

#[async_trait]
impl AgentConnector for TcpClusterClient {
    async fn connect(
        &self,
        location: &AgentLocation,
    ) -> Result<Box<dyn AgentSession>, DispatchError> {
        let connection =
            JsonLineConnection::connect(&location.server, self.connect_timeout).await?;
        Ok(Box::new(TcpAgentSession { connection }))
    }
}

/// Conversation with one agent
#[derive(Debug)]
pub struct TcpAgentSession {
    connection: JsonLineConnection,
}

impl TcpAgentSession {
    async fn call(&mut self, request: AgentRequest) -> Result<AgentResponse, DispatchError> {
        match self.connection.request(request).await? {
            AgentResponse::Error { message } => Err(DispatchError::Agent(message)),
            response => Ok(response),
        }
    }
}

fn unexpected(response: AgentResponse) -> DispatchError {
    DispatchError::Protocol(format!("unexpected agent response {response:?}"))
}

#[async_trait]
impl AgentSession for TcpAgentSession {
    async fn file_inventory(&mut self) -> Result<HashMap<String, String>, DispatchError> {
        match self.call(AgentRequest::FileInventory).await? {
            AgentResponse::Inventory { files } => Ok(files),
            other => Err(unexpected(other)),
        }
    }

    async fn ship_file(
        &mut self,
        name: &str,
        version: &str,
        contents: Vec<u8>,
    ) -> Result<(), DispatchError> {
        let request = AgentRequest::ShipFile {
            name: name.to_string(),
            version: version.to_string(),
            contents,
        };
        match self.call(request).await? {
            AgentResponse::FileStored { .. } | AgentResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn execute(&mut self, request: TaskGroupRequest) -> Result<(), DispatchError> {
        match self.call(AgentRequest::ExecuteTaskGroup { request }).await? {
            AgentResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn next_event(&mut self) -> Result<Option<ProgressEvent>, DispatchError> {
        let Some(envelope) = self.connection.recv::<Envelope<AgentResponse>>().await? else {
            return Ok(None);
        };
        match envelope.payload {
            AgentResponse::Progress(event) => Ok(Some(event)),
            AgentResponse::Error { message } => Err(DispatchError::Agent(message)),
            other => Err(unexpected(other)),
        }
    }

    async fn abort(&mut self, task_group_id: TaskGroupId) -> Result<(), DispatchError> {
        // Fire and forget; the agent closes the progress stream when it stops
        self.connection
            .send(&Envelope::new(AgentRequest::Abort { task_group_id }))
            .await?;
        Ok(())
    }

    async fn delete_output(&mut self, request: DeleteOutputRequest) -> Result<(), DispatchError> {
        match self.call(AgentRequest::DeleteOutput(request)).await? {
            AgentResponse::Deleted { .. } | AgentResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
