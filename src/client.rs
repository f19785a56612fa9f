// src/client.rs

//! Client library: sessions, submissions, task events and object fetches.
//!
//! Requests are answered in order, so each call waits for its own reply.
//! Task events arriving in the meantime are queued for [`Client::next_event`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::errors::{GovernorError, Result};
use crate::graph::{ObjectSpec, TaskSpec};
use crate::protocol::codec;
use crate::protocol::{
    ClientEvent, FetchResult, FromClient, Hello, HelloReply, PROTOCOL_VERSION, ServerInfo,
    ToClient,
};
use crate::types::{ClientId, FailureReason, ObjectId, SessionId, SubmissionId, TaskId};
use crate::worker::data_server;

#[derive(Debug)]
pub struct Client {
    id: ClientId,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    events: VecDeque<ClientEvent>,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let mut framed = codec::framed(stream);
        codec::send(
            &mut framed,
            &Hello::Client {
                version: PROTOCOL_VERSION,
            },
        )
        .await?;
        let id = match codec::expect(&mut framed).await? {
            HelloReply::ClientAccepted { client } => client,
            HelloReply::Rejected(reason) => return Err(GovernorError::Protocol(reason)),
            other => {
                return Err(GovernorError::Protocol(format!(
                    "unexpected handshake reply {other:?}"
                )));
            }
        };
        debug!(client = %id, "connected to coordinator");
        Ok(Self {
            id,
            framed,
            events: VecDeque::new(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn open_session(&mut self) -> Result<SessionId> {
        match self.request(FromClient::OpenSession).await? {
            ToClient::SessionOpened { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    /// Submit tasks and objects. A rejected submission changes nothing on
    /// the coordinator.
    pub async fn submit(
        &mut self,
        session: SessionId,
        tasks: Vec<TaskSpec>,
        objects: Vec<ObjectSpec>,
    ) -> Result<SubmissionId> {
        let request = FromClient::Submit {
            session,
            tasks,
            objects,
        };
        match self.request(request).await? {
            ToClient::Submitted { submission } => Ok(submission),
            ToClient::SubmitRejected(err) => Err(GovernorError::Graph(err)),
            other => Err(unexpected(other)),
        }
    }

    /// Release kept objects so they can be collected.
    pub async fn unkeep(&mut self, session: SessionId, objects: Vec<ObjectId>) -> Result<()> {
        self.send(FromClient::Unkeep { session, objects }).await
    }

    /// Request cancellation. Outcomes arrive as `TaskFailed` events.
    pub async fn cancel(&mut self, session: SessionId, tasks: Vec<TaskId>) -> Result<()> {
        self.send(FromClient::Cancel { session, tasks }).await
    }

    /// Content of `object`, or `None` if it is not currently readable.
    pub async fn fetch(&mut self, session: SessionId, object: ObjectId) -> Result<Option<Vec<u8>>> {
        let reply = self.request(FromClient::Fetch { session, object }).await?;
        let result = match reply {
            ToClient::FetchReply { result, .. } => result,
            other => return Err(unexpected(other)),
        };
        match result {
            FetchResult::Inline(data) => Ok(Some(data)),
            FetchResult::Worker { address, .. } => data_server::pull(&address, object).await,
            FetchResult::NotAvailable => Ok(None),
        }
    }

    pub async fn close_session(&mut self, session: SessionId) -> Result<()> {
        match self.request(FromClient::CloseSession { session }).await? {
            ToClient::SessionClosed { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn server_info(&mut self) -> Result<ServerInfo> {
        match self.request(FromClient::ServerInfo).await? {
            ToClient::ServerInfo(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn next_event(&mut self) -> Result<ClientEvent> {
        if let Some(event) = self.events.pop_front() {
            return Ok(event);
        }
        loop {
            match codec::expect(&mut self.framed).await? {
                ToClient::Event(event) => return Ok(event),
                ToClient::Error(message) => return Err(GovernorError::Protocol(message)),
                other => debug!(?other, "reply without a pending request dropped"),
            }
        }
    }

    /// Wait until every task in `tasks` has finished or failed.
    ///
    /// Events for other tasks are kept for later calls.
    pub async fn wait_for(
        &mut self,
        tasks: &[TaskId],
    ) -> Result<BTreeMap<TaskId, std::result::Result<(), FailureReason>>> {
        let mut pending: BTreeSet<TaskId> = tasks.iter().copied().collect();
        let mut outcomes = BTreeMap::new();
        let mut unrelated = VecDeque::new();

        while !pending.is_empty() {
            let event = self.next_event().await?;
            let (task, outcome) = match &event {
                ClientEvent::TaskFinished { task } => (*task, Ok(())),
                ClientEvent::TaskFailed { task, reason } => (*task, Err(reason.clone())),
                ClientEvent::ObjectLost { .. } => {
                    unrelated.push_back(event);
                    continue;
                }
            };
            if pending.remove(&task) {
                outcomes.insert(task, outcome);
            } else {
                unrelated.push_back(event);
            }
        }

        unrelated.extend(self.events.drain(..));
        self.events = unrelated;
        Ok(outcomes)
    }

    async fn send(&mut self, request: FromClient) -> Result<()> {
        codec::send(&mut self.framed, &request).await
    }

    async fn request(&mut self, request: FromClient) -> Result<ToClient> {
        self.send(request).await?;
        loop {
            match codec::expect(&mut self.framed).await? {
                ToClient::Event(event) => self.events.push_back(event),
                ToClient::Error(message) => return Err(GovernorError::Protocol(message)),
                reply => return Ok(reply),
            }
        }
    }
}

fn unexpected(reply: ToClient) -> GovernorError {
    GovernorError::Protocol(format!("unexpected reply {reply:?}"))
}
