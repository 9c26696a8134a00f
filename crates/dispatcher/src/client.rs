use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use errors::ErrorMetadata;
use pb::{
    agent::{
        task_batch_client::TaskBatchClient,
        task_client::TaskClient,
        TaskRequest,
    },
    status::ErrorMetadataStatusExt,
};
use tonic::{
    transport::{
        Channel,
        Endpoint,
    },
    Response,
    Status,
};

use crate::{
    knobs::{
        AGENT_CONNECT_TIMEOUT,
        AGENT_PROBE_TIMEOUT,
        AGENT_RPC_TIMEOUT,
        MAX_AGENT_REPLY_BYTES,
        MAX_REQUEST_BODY_BYTES,
    },
    metrics::{
        agent_rpc_timer,
        log_agent_rpc_error,
    },
};

/// Transport to the worker agents.
#[async_trait]
pub trait AgentRpc: Send + Sync + 'static {
    /// Runs one invocation on the agent at `address` and returns its
    /// serialized HTTP reply.
    async fn execute(&self, address: &str, request: TaskRequest) -> anyhow::Result<Bytes>;

    /// Asks the agent at `address` which of `fingerprints` it holds. The
    /// reply has one slot per fingerprint, empty on a miss.
    async fn probe(&self, address: &str, fingerprints: Vec<String>) -> anyhow::Result<Vec<Bytes>>;
}

/// gRPC client that dials the agent for every call and hangs up afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct GrpcAgentRpc;

impl GrpcAgentRpc {
    pub fn new() -> Self {
        Self
    }
}

async fn connect(address: &str, deadline: Duration) -> anyhow::Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{address}"))?
        .connect_timeout(*AGENT_CONNECT_TIMEOUT)
        .timeout(deadline);
    Ok(endpoint.connect().await?)
}

fn handle_response<T>(response: Result<Response<T>, Status>) -> anyhow::Result<T> {
    match response {
        Ok(response) => Ok(response.into_inner()),
        Err(status) => Err(status.into_anyhow()),
    }
}

fn unreachable(address: &str, kind: &'static str, e: impl std::fmt::Display) -> anyhow::Error {
    log_agent_rpc_error(kind);
    anyhow::anyhow!(ErrorMetadata::internal(
        "AgentUnreachable",
        format!("Agent at {address} failed ({kind}): {e}"),
    ))
}

#[async_trait]
impl AgentRpc for GrpcAgentRpc {
    async fn execute(&self, address: &str, task: TaskRequest) -> anyhow::Result<Bytes> {
        let deadline = *AGENT_RPC_TIMEOUT;
        let timer = agent_rpc_timer();
        let call = async {
            let channel = connect(address, deadline)
                .await
                .map_err(|e| unreachable(address, "dial", format!("{e:#}")))?;
            let mut client = TaskClient::new(channel)
                .max_decoding_message_size(*MAX_AGENT_REPLY_BYTES)
                .max_encoding_message_size(*MAX_REQUEST_BODY_BYTES * 2);
            let mut request = tonic::Request::new(task);
            request.set_timeout(deadline);
            let reply = handle_response(client.task_assign(request).await)
                .map_err(|e| unreachable(address, "call", format!("{e:#}")))?;
            anyhow::Ok(reply.response)
        };
        let response = tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| unreachable(address, "deadline", format!("no reply within {deadline:?}")))??;
        timer.finish();
        Ok(response)
    }

    async fn probe(&self, address: &str, fingerprints: Vec<String>) -> anyhow::Result<Vec<Bytes>> {
        let deadline = *AGENT_PROBE_TIMEOUT;
        let expected = fingerprints.len();
        let call = async {
            let channel = connect(address, deadline).await?;
            let mut client =
                TaskBatchClient::new(channel).max_decoding_message_size(*MAX_AGENT_REPLY_BYTES);
            let mut request = tonic::Request::new(TaskRequest::probe(fingerprints));
            request.set_timeout(deadline);
            let slots = handle_response(client.task_assign(request).await)?.into_slots(expected)?;
            anyhow::Ok(slots)
        };
        tokio::time::timeout(deadline, call)
            .await
            .map_err(|_| anyhow::anyhow!("Probe to {address} got no reply within {deadline:?}"))?
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::Bytes;
    use errors::ErrorMetadataAnyhowExt;
    use pb::agent::TaskRequest;
    use pretty_assertions::assert_eq;

    use super::{
        AgentRpc,
        GrpcAgentRpc,
    };
    use crate::{
        testing::spawn_agent_server,
        wire::{
            parse_response,
            serialize_request,
        },
    };

    #[tokio::test]
    async fn test_execute_and_probe_over_grpc() -> anyhow::Result<()> {
        let server = spawn_agent_server(HashMap::from([(
            "abc".to_owned(),
            Bytes::from_static(b"HTTP/1.1 200 OK\r\ncontent-length: 6\r\n\r\ncached"),
        )]))
        .await?;
        let rpc = GrpcAgentRpc::new();

        let request = http::Request::post("/function/echo")
            .header("host", "front-door")
            .body(Bytes::from_static(b"hi"))?;
        let reply = rpc
            .execute(
                &server.address,
                TaskRequest::execution("echo", "", serialize_request(&request)),
            )
            .await?;
        let reply = parse_response(&reply)?;
        assert_eq!(reply.status(), http::StatusCode::OK);
        assert_eq!(reply.body().as_ref(), b"hi");
        assert_eq!(server.executions(), 1);

        let slots = rpc
            .probe(&server.address, vec!["nope".to_owned(), "abc".to_owned()])
            .await?;
        assert_eq!(slots.len(), 2);
        assert!(slots[0].is_empty());
        assert!(slots[1].ends_with(b"cached"));
        Ok(())
    }

    #[tokio::test]
    async fn test_execute_against_closed_port_is_internal_error() {
        let rpc = GrpcAgentRpc::new();
        let err = rpc
            .execute(
                "127.0.0.1:1",
                TaskRequest::execution("echo", "", Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.short_msg(), "AgentUnreachable");
        assert_eq!(err.http_status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
