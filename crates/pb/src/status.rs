use std::fmt::Display;

use errors::ErrorMetadataAnyhowExt;

pub trait ErrorMetadataStatusExt {
    fn from_anyhow(error: anyhow::Error) -> Self;
    fn into_anyhow(self) -> anyhow::Error;
    fn context<C>(self, context: C) -> Self
    where
        C: Display + Send + Sync + 'static;
}

impl ErrorMetadataStatusExt for tonic::Status {
    fn from_anyhow(error: anyhow::Error) -> Self {
        let message = format!("{error:#}");
        tonic::Status::new(error.grpc_status_code(), message)
    }

    fn into_anyhow(self) -> anyhow::Error {
        anyhow::anyhow!("{:?}: {}", self.code(), self.message())
    }

    fn context<C>(self, context: C) -> Self
    where
        C: Display + Send + Sync + 'static,
    {
        let anyhow_err = self.into_anyhow();
        Self::from_anyhow(anyhow_err.context(context))
    }
}
