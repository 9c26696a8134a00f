//! Test agents: an in-memory [`AgentRpc`] and a real gRPC agent server.
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use http::Response;
use parking_lot::Mutex;
use pb::{
    agent::{
        task_batch_server::{
            TaskBatch,
            TaskBatchServer,
        },
        task_server::{
            Task,
            TaskServer,
        },
        TaskRequest,
        TaskResponse,
        TasksResponse,
    },
    status::ErrorMetadataStatusExt,
};
use tokio::sync::{
    oneshot,
    watch,
    Notify,
};
use tokio_stream::wrappers::TcpListenerStream;

use crate::{
    wire::{
        parse_request,
        serialize_response,
    },
    AgentId,
    AgentRpc,
};

/// Reply of an echoing agent: 200 with the request body, labelled with the
/// agent that produced it.
pub fn echo_reply(agent: &str, serialized_request: &Bytes) -> anyhow::Result<Bytes> {
    let request = parse_request(serialized_request)?;
    let mut builder = Response::builder().status(200).header("x-agent", agent);
    if let Some(content_type) = request.headers().get(http::header::CONTENT_TYPE) {
        builder = builder.header(http::header::CONTENT_TYPE, content_type);
    }
    Ok(serialize_response(&builder.body(request.into_body())?))
}

#[derive(Default)]
struct FakeAgent {
    cached: HashMap<String, Bytes>,
    reply: Option<Bytes>,
    fail_probes: bool,
    hang_probes: bool,
    probe_delay: Option<Duration>,
    fail_executions: bool,
    probe_calls: usize,
    executions: usize,
    last_task: Option<TaskRequest>,
}

/// In-memory agents addressed as `fake-agent-{id}`. Executions echo the
/// request body unless a canned reply is set; probes answer from primed
/// fingerprints.
pub struct FakeAgents {
    agents: Mutex<Vec<FakeAgent>>,
    gate: watch::Sender<bool>,
    started: Notify,
}

impl FakeAgents {
    pub fn new(num_agents: usize) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            agents: Mutex::new((0..num_agents).map(|_| FakeAgent::default()).collect()),
            gate,
            started: Notify::new(),
        })
    }

    pub fn addresses(&self) -> Vec<String> {
        (0..self.agents.lock().len())
            .map(|id| format!("fake-agent-{id}"))
            .collect()
    }

    fn agent_id(address: &str) -> anyhow::Result<AgentId> {
        address
            .strip_prefix("fake-agent-")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("Unknown fake agent {address}"))
    }

    /// Makes `agent` report a hit with `reply` when probed for `fingerprint`.
    pub fn prime(&self, agent: AgentId, fingerprint: &str, reply: Bytes) {
        self.agents.lock()[agent]
            .cached
            .insert(fingerprint.to_owned(), reply);
    }

    pub fn set_reply(&self, agent: AgentId, reply: Bytes) {
        self.agents.lock()[agent].reply = Some(reply);
    }

    pub fn fail_probes(&self, agent: AgentId) {
        self.agents.lock()[agent].fail_probes = true;
    }

    /// Probes to `agent` never complete.
    pub fn hang_probes(&self, agent: AgentId) {
        self.agents.lock()[agent].hang_probes = true;
    }

    /// Probes to `agent` answer only after `delay`.
    pub fn delay_probes(&self, agent: AgentId, delay: Duration) {
        self.agents.lock()[agent].probe_delay = Some(delay);
    }

    pub fn fail_executions(&self, agent: AgentId) {
        self.agents.lock()[agent].fail_executions = true;
    }

    /// Holds every execution after it starts until [`Self::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Resolves once per execution that has started.
    pub async fn execution_started(&self) {
        self.started.notified().await
    }

    pub fn executions(&self, agent: AgentId) -> usize {
        self.agents.lock()[agent].executions
    }

    pub fn total_executions(&self) -> usize {
        self.agents.lock().iter().map(|a| a.executions).sum()
    }

    /// The most recent execution request `agent` received.
    pub fn last_task(&self, agent: AgentId) -> Option<TaskRequest> {
        self.agents.lock()[agent].last_task.clone()
    }

    pub fn probe_calls(&self, agent: AgentId) -> usize {
        self.agents.lock()[agent].probe_calls
    }
}

#[async_trait]
impl AgentRpc for FakeAgents {
    async fn execute(&self, address: &str, request: TaskRequest) -> anyhow::Result<Bytes> {
        let id = Self::agent_id(address)?;
        let (fail, reply) = {
            let mut agents = self.agents.lock();
            let agent = &mut agents[id];
            agent.executions += 1;
            agent.last_task = Some(request.clone());
            (agent.fail_executions, agent.reply.clone())
        };
        self.started.notify_one();
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await?;
        anyhow::ensure!(!fail, "Agent {id} is down");
        match reply {
            Some(reply) => Ok(reply),
            None => echo_reply(&id.to_string(), &request.serialized_request),
        }
    }

    async fn probe(&self, address: &str, fingerprints: Vec<String>) -> anyhow::Result<Vec<Bytes>> {
        let id = Self::agent_id(address)?;
        let (fail, hang, delay, slots) = {
            let mut agents = self.agents.lock();
            let agent = &mut agents[id];
            agent.probe_calls += 1;
            let slots = fingerprints
                .iter()
                .map(|f| agent.cached.get(f).cloned().unwrap_or_default())
                .collect::<Vec<_>>();
            (agent.fail_probes, agent.hang_probes, agent.probe_delay, slots)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        anyhow::ensure!(!fail, "Agent {id} refused the probe");
        Ok(slots)
    }
}

#[derive(Clone)]
struct EchoAgent {
    cached: Arc<HashMap<String, Bytes>>,
    executions: Arc<AtomicUsize>,
}

#[tonic::async_trait]
impl Task for EchoAgent {
    async fn task_assign(
        &self,
        request: tonic::Request<TaskRequest>,
    ) -> Result<tonic::Response<TaskResponse>, tonic::Status> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let request = request.into_inner();
        let reply = echo_reply("grpc", &request.serialized_request)
            .map_err(tonic::Status::from_anyhow)?;
        Ok(tonic::Response::new(reply.into()))
    }
}

#[tonic::async_trait]
impl TaskBatch for EchoAgent {
    async fn task_assign(
        &self,
        request: tonic::Request<TaskRequest>,
    ) -> Result<tonic::Response<TasksResponse>, tonic::Status> {
        let responses = request
            .into_inner()
            .request_hashes
            .iter()
            .map(|hash| self.cached.get(hash).cloned().unwrap_or_default())
            .collect();
        Ok(tonic::Response::new(TasksResponse { responses }))
    }
}

/// A gRPC agent listening on an ephemeral localhost port. Stops when
/// dropped.
pub struct AgentServerHandle {
    pub address: String,
    executions: Arc<AtomicUsize>,
    _shutdown: oneshot::Sender<()>,
}

impl AgentServerHandle {
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

/// Serves an echoing agent that answers probes from `cached`.
pub async fn spawn_agent_server(
    cached: HashMap<String, Bytes>,
) -> anyhow::Result<AgentServerHandle> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let address = listener.local_addr()?.to_string();
    let agent = EchoAgent {
        cached: Arc::new(cached),
        executions: Arc::new(AtomicUsize::new(0)),
    };
    let executions = agent.executions.clone();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let incoming = TcpListenerStream::new(listener);
    tokio::spawn(async move {
        let result = tonic::transport::Server::builder()
            .add_service(TaskServer::new(agent.clone()))
            .add_service(TaskBatchServer::new(agent))
            .serve_with_incoming_shutdown(incoming, async {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Test agent server failed: {e:?}");
        }
    });
    Ok(AgentServerHandle {
        address,
        executions,
        _shutdown: shutdown_tx,
    })
}
