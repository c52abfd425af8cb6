//! In-memory container runtime used to drive the engine without a daemon.

#![allow(dead_code)]

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::errors::Error as RuntimeError;
use bollard::models::{ContainerCreateBody, ContainerState};
use bytes::Bytes;
use dockbox_core::{Limits, Profile, Shell};
use dockbox_engine::{ArchiveStream, Attachment, ContainerRuntime, Engine, OutputStream};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

#[derive(Debug, Default)]
pub struct MockState {
    /// Every runtime call as `operation:target`, in order.
    pub calls: Vec<String>,
    pub bodies: Vec<(String, ContainerCreateBody)>,
    pub uploads: Vec<(String, String, Bytes)>,
    pub stdin: Vec<u8>,
    pub containers: Vec<String>,
    pub started: HashSet<String>,
    pub volumes: HashSet<String>,
    pub volume_in_use: bool,
    /// Frames every output stream yields before anything else.
    pub frames: Vec<LogOutput>,
    /// Attached output repeats whatever is written to stdin.
    pub echo_stdin: bool,
    /// Output streams never end after their frames.
    pub hang: bool,
    pub container_state: ContainerState,
    next_id: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn stdout(&self, text: &str) -> &Self {
        self.state().frames.push(LogOutput::StdOut {
            message: Bytes::copy_from_slice(text.as_bytes()),
        });
        self
    }

    pub fn stderr(&self, text: &str) -> &Self {
        self.state().frames.push(LogOutput::StdErr {
            message: Bytes::copy_from_slice(text.as_bytes()),
        });
        self
    }

    pub fn exits_with(&self, exit_code: i64, started_at: &str, finished_at: &str) -> &Self {
        self.state().container_state = ContainerState {
            exit_code: Some(exit_code),
            started_at: Some(started_at.to_string()),
            finished_at: Some(finished_at.to_string()),
            oom_killed: Some(false),
            ..Default::default()
        };
        self
    }

    fn record(&self, call: String) {
        self.state().calls.push(call);
    }

    fn scripted_output(&self) -> OutputStream {
        let state = self.state();
        let frames = stream::iter(state.frames.clone().into_iter().map(Ok));
        if state.hang {
            frames.chain(stream::pending()).boxed()
        } else {
            frames.boxed()
        }
    }
}

fn server_error(status_code: u16, message: &str) -> RuntimeError {
    RuntimeError::DockerResponseServerError {
        status_code,
        message: message.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);

        state.calls.push(format!("create:{}", name));
        state.bodies.push((id.clone(), body));
        state.containers.push(id.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("start:{}", id));
        if !state.started.insert(id.to_string()) {
            return Err(server_error(304, "container already started"));
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("stop:{}", id));
        if !state.started.remove(id) {
            return Err(server_error(304, "container already stopped"));
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("remove:{}", id));
        state.started.remove(id);
        state.containers.retain(|c| c != id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.record(format!("inspect:{}", id));
        Ok(self.state().container_state.clone())
    }

    async fn list_containers(&self, ids: &[String]) -> Result<Vec<String>, RuntimeError> {
        let state = self.state();
        Ok(state
            .containers
            .iter()
            .filter(|c| ids.contains(c))
            .cloned()
            .collect())
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("create_volume:{}", name));
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state();
        state.calls.push(format!("remove_volume:{}", name));
        if state.volume_in_use {
            return Err(server_error(409, "volume is in use"));
        }
        state.volumes.remove(name);
        Ok(())
    }

    async fn upload_archive(
        &self,
        id: &str,
        path: &str,
        archive: ArchiveStream,
    ) -> Result<(), RuntimeError> {
        let chunks: Vec<Bytes> = archive
            .try_collect()
            .await
            .map_err(|err| RuntimeError::IOError { err })?;
        let archive = Bytes::from(chunks.concat());

        let mut state = self.state();
        state.calls.push(format!("upload:{}", id));
        state.uploads.push((id.to_string(), path.to_string(), archive));
        Ok(())
    }

    async fn attach_container(&self, id: &str) -> Result<Attachment, RuntimeError> {
        self.record(format!("attach:{}", id));

        let (tx, rx) = unbounded_channel::<Bytes>();
        let output = if self.state().echo_stdin {
            let echoed = stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|message| (Ok(LogOutput::StdOut { message }), rx))
            });
            self.scripted_output().chain(echoed).boxed()
        } else {
            self.scripted_output()
        };

        Ok(Attachment {
            output,
            input: Box::pin(RecordingWriter {
                state: self.state.clone(),
                tx,
            }),
        })
    }

    fn follow_logs(&self, id: &str) -> OutputStream {
        self.record(format!("logs:{}", id));
        self.scripted_output()
    }
}

/// Stdin end of a mock attachment: records writes and forwards them to the echo stream.
struct RecordingWriter {
    state: Arc<Mutex<MockState>>,
    tx: UnboundedSender<Bytes>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.state.lock().unwrap().stdin.extend_from_slice(buf);
        // The echo stream may already be gone
        let _ = self.tx.send(Bytes::copy_from_slice(buf));
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// `python` allows one second, `gcc` three.
pub fn profiles() -> Vec<Profile> {
    vec![
        Profile::new("python", "python:3.12-alpine", "python-box", "nobody")
            .with_limits(Limits::new(1, 128, 1))
            .with_network_disabled(true),
        Profile::new("gcc", "gcc:14", "gcc-box", "root").with_limits(Limits::new(2, 256, 3)),
    ]
}

pub fn engine(runtime: &MockRuntime) -> Engine {
    let mut engine = Engine::with_runtime(Shell::Sh, Arc::new(runtime.clone()));
    engine.add_profiles(profiles());
    engine
}
