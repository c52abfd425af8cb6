use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as RuntimeError;
use bollard::models::{ContainerCreateBody, ContainerState};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::pin::Pin;
use tokio::io::AsyncWrite;

/// Frames streamed back from a container, each tagged with its stream type.
pub type OutputStream = BoxStream<'static, Result<LogOutput, RuntimeError>>;

/// Chunks of a tar archive read from disk as it is uploaded.
pub type ArchiveStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Writable end of a container's stdin.
pub type StdinWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// A bidirectional attachment to a container.
pub struct Attachment {
    pub output: OutputStream,
    pub input: StdinWriter,
}

/// The container runtime operations the engine depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container with the given name, returning its id
    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove a container, running or not
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// List the ids of all containers (stopped ones included) matching `ids`
    async fn list_containers(&self, ids: &[String]) -> Result<Vec<String>, RuntimeError>;

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    /// Extract a (possibly compressed) tar archive into `path` inside the container
    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: ArchiveStream,
    ) -> Result<(), RuntimeError>;

    /// Attach to stdin, stdout and stderr, including output logged so far
    async fn attach_container(&self, id: &str) -> Result<Attachment, RuntimeError>;

    /// Follow stdout and stderr until the container exits
    fn follow_logs(&self, id: &str) -> OutputStream;
}

/// HTTP status the runtime answered with, if the failure came from the daemon.
pub fn status_code(err: &RuntimeError) -> Option<u16> {
    match err {
        RuntimeError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// 304: the container is already in the requested state.
pub fn is_not_modified(err: &RuntimeError) -> bool {
    status_code(err) == Some(304)
}

/// 409: the resource is still referenced by something else.
pub fn is_conflict(err: &RuntimeError) -> bool {
    status_code(err) == Some(409)
}
