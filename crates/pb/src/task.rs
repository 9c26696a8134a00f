use bytes::Bytes;

use crate::agent::{
    TaskRequest,
    TaskResponse,
    TasksResponse,
};

impl TaskRequest {
    /// A request asking one agent to execute an invocation.
    pub fn execution(
        function_name: impl Into<String>,
        extra_path: impl Into<String>,
        serialized_request: Bytes,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            extra_path: extra_path.into(),
            serialized_request,
            request_hashes: vec![],
        }
    }

    /// A request asking an agent which of `request_hashes` it holds.
    pub fn probe(request_hashes: Vec<String>) -> Self {
        Self {
            request_hashes,
            ..Default::default()
        }
    }

    pub fn is_probe(&self) -> bool {
        !self.request_hashes.is_empty()
    }
}

impl From<Bytes> for TaskResponse {
    fn from(response: Bytes) -> Self {
        Self { response }
    }
}

impl TasksResponse {
    /// Checks that there is exactly one reply slot per probed fingerprint.
    pub fn into_slots(self, expected: usize) -> anyhow::Result<Vec<Bytes>> {
        anyhow::ensure!(
            self.responses.len() == expected,
            "Agent answered {} probe slots for {expected} fingerprints",
            self.responses.len()
        );
        Ok(self.responses)
    }
}
