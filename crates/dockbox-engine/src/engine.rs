use bollard::container::LogOutput;
use bollard::models::{
    ContainerCreateBody, ContainerState, HostConfig, Mount, MountTypeEnum, MountVolumeOptions,
};
use chrono::{DateTime, FixedOffset};
use dockbox_core::{
    Bindings, Command, DockboxError, EngineConfig, Profile, Result, RunResult, Shell,
};
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use crate::docker::DockerRuntime;
use crate::tracker::{self, SharedTracker};
use crate::traits::{is_not_modified, Attachment, ContainerRuntime, OutputStream};
use crate::working_dir::WorkingDirectory;

/// Control byte appended to stdin for commands that only stop at an explicit EOF.
pub const EOF_MARKER: u8 = 0x04;

/// Timestamp the runtime reports for a container that never started or finished.
const UNSET_TIMESTAMP: &str = "0001-01-01T00:00:00Z";

/// Runs commands in containers built from registered profiles.
///
/// Every container goes through create, start, [`Engine::get_result`] and
/// [`Engine::remove_container`] in that order. Containers left behind by a
/// failed run are reclaimed with [`Engine::cleanup_containers`].
pub struct Engine {
    runtime: Arc<dyn ContainerRuntime>,
    shell: Shell,
    profiles: HashMap<String, Profile>,
    tracker: SharedTracker,
    attachments: HashMap<String, Attachment>,
    active_directory: Option<(String, Arc<AtomicBool>)>,
}

impl Engine {
    pub fn with_runtime(shell: Shell, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            shell,
            profiles: HashMap::new(),
            tracker: SharedTracker::new(),
            attachments: HashMap::new(),
            active_directory: None,
        }
    }

    /// Connects to the runtime named in `config` and registers its profiles.
    pub fn connect(config: &EngineConfig) -> Result<Self> {
        let runtime = DockerRuntime::connect(config)?;
        let mut engine = Self::with_runtime(config.shell, Arc::new(runtime));
        engine.add_profiles(config.profiles.iter().cloned());
        Ok(engine)
    }

    /// Registers profiles by name, replacing any with the same name.
    pub fn add_profiles(&mut self, profiles: impl IntoIterator<Item = Profile>) {
        for profile in profiles {
            debug!("Registering profile {}", profile.profile_name);
            self.profiles.insert(profile.profile_name.clone(), profile);
        }
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> Vec<&Profile> {
        self.profiles.values().collect()
    }

    pub fn shell(&self) -> Shell {
        self.shell
    }

    pub fn runtime(&self) -> Arc<dyn ContainerRuntime> {
        self.runtime.clone()
    }

    pub fn tracker(&self) -> SharedTracker {
        self.tracker.clone()
    }

    /// Opens a new working directory mounted at `path`.
    ///
    /// Only one working directory per engine may be open at a time.
    pub async fn open(&mut self, path: impl Into<String>) -> Result<WorkingDirectory> {
        if let Some((name, closed)) = &self.active_directory {
            if !closed.load(Ordering::SeqCst) {
                return Err(DockboxError::WorkingDirectoryActive(name.clone()));
            }
        }

        let mut directory = WorkingDirectory::new(self.runtime.clone(), path.into());
        directory.open().await?;
        self.active_directory = Some((directory.name().to_string(), directory.closed_flag()));

        Ok(directory)
    }

    /// Creates, but does not start, a container for `command` under `profile_name`.
    ///
    /// The shell prologue is prepended to `command`. With non-empty `stdin` the
    /// container is attached to and the input written before this returns.
    #[instrument(skip(self, command, bindings, working_directory, stdin, envs))]
    pub async fn create_container(
        &mut self,
        profile_name: &str,
        command: &mut Command,
        bindings: &Bindings,
        working_directory: &WorkingDirectory,
        stdin: Option<&str>,
        envs: &[String],
    ) -> Result<String> {
        let profile = self
            .profiles
            .get(profile_name)
            .cloned()
            .ok_or_else(|| DockboxError::UnknownProfile(profile_name.to_string()))?;

        if !working_directory.is_open() {
            return Err(DockboxError::WorkingDirectoryClosed(
                working_directory.name().to_string(),
            ));
        }

        let stdin = stdin.filter(|s| !s.is_empty());
        command.prepend_shell(self.shell);

        let body = container_body(
            &profile,
            command,
            bindings,
            working_directory,
            envs,
            stdin.is_some(),
        );
        let id = self
            .runtime
            .create_container(&profile.container_name, body)
            .await
            .map_err(|e| DockboxError::runtime("create_container", e))?;

        info!(
            "Created container {} ({}) for: {}",
            id,
            profile.profile_name,
            command.text()
        );
        self.tracker.lock().track(&id, profile);

        if let Some(stdin) = stdin {
            let mut attachment = self
                .runtime
                .attach_container(&id)
                .await
                .map_err(|e| DockboxError::runtime("attach_container", e))?;

            let payload = stdin_payload(command.text(), stdin);
            write_stdin(&mut attachment, &payload)
                .await
                .map_err(|source| DockboxError::Stdin {
                    container_id: id.clone(),
                    source,
                })?;
            debug!("Wrote {} bytes of stdin to {}", payload.len(), id);

            self.attachments.insert(id.clone(), attachment);
        }

        Ok(id)
    }

    /// Starts a container. Starting one that is already running is a no-op.
    #[instrument(skip(self))]
    pub async fn start_container(&self, id: &str) -> Result<()> {
        match self.runtime.start_container(id).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!("Container {} already started", id);
                Ok(())
            }
            Err(e) => Err(DockboxError::runtime("start_container", e)),
        }
    }

    /// Stops a container. Stopping one that is not running is a no-op.
    #[instrument(skip(self))]
    pub async fn stop_container(&self, id: &str) -> Result<()> {
        match self.runtime.stop_container(id).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_modified(&e) => {
                debug!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => Err(DockboxError::runtime("stop_container", e)),
        }
    }

    /// Waits for a started container's output, bounded by its profile's
    /// timeout, then inspects its final state.
    ///
    /// On timeout the container is stopped but not removed, and the returned
    /// output holds only what arrived before the deadline.
    #[instrument(skip(self))]
    pub async fn get_result(&mut self, id: &str) -> Result<RunResult> {
        let timeout = self
            .tracker
            .lock()
            .profile(id)
            .map(|profile| Duration::from_secs(profile.limits.timeout))
            .ok_or_else(|| DockboxError::UntrackedContainer(id.to_string()))?;

        let mut output = CapturedOutput::default();
        let collected = match self.attachments.remove(id) {
            Some(mut attachment) => {
                let collected =
                    tokio::time::timeout(timeout, output.drain(&mut attachment.output, true))
                        .await;
                // Closing stdin lets programs blocked on input see EOF
                if let Err(e) = attachment.input.shutdown().await {
                    debug!("Could not close stdin of {}: {}", id, e);
                }
                collected
            }
            None => {
                let mut logs = self.runtime.follow_logs(id);
                tokio::time::timeout(timeout, output.drain(&mut logs, false)).await
            }
        };

        let timed_out = match collected {
            Ok(result) => {
                result?;
                false
            }
            Err(_) => {
                warn!("Container {} timed out after {:?}", id, timeout);
                self.stop_container(id).await?;
                true
            }
        };

        let state = self
            .runtime
            .inspect_container(id)
            .await
            .map_err(|e| DockboxError::runtime("inspect_container", e))?;

        let result = RunResult {
            exit_code: exit_code(&state),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            out_of_memory: state.oom_killed.unwrap_or(false),
            timed_out,
            duration: duration_seconds(state.started_at.as_deref(), state.finished_at.as_deref()),
        };
        info!(
            "Container {} finished: exit {:?}, oom {}, timed out {}",
            id,
            result.exit_code(),
            result.out_of_memory,
            result.timed_out
        );

        Ok(result)
    }

    /// Force-removes a container and forgets it.
    #[instrument(skip(self))]
    pub async fn remove_container(&mut self, id: &str) -> Result<()> {
        self.runtime
            .remove_container(id)
            .await
            .map_err(|e| DockboxError::runtime("remove_container", e))?;

        self.tracker.lock().forget(id);
        self.attachments.remove(id);
        debug!("Removed container {}", id);
        Ok(())
    }

    /// Removes every container this engine created that still exists.
    ///
    /// Meant for error paths, so a retry does not hit container name conflicts.
    #[instrument(skip(self))]
    pub async fn cleanup_containers(&mut self) -> Result<usize> {
        let removed = tracker::reclaim(self.runtime.as_ref(), &self.tracker).await?;
        for id in &removed {
            self.attachments.remove(id);
        }
        self.attachments
            .retain(|id, _| self.tracker.lock().contains(id));

        Ok(removed.len())
    }
}

/// Output collected from a container, split by stream.
#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CapturedOutput {
    /// Drains `stream` until it ends or, when `watch_eof` is set, until a
    /// frame ends with [`EOF_MARKER`].
    async fn drain(&mut self, stream: &mut OutputStream, watch_eof: bool) -> Result<()> {
        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(|e| DockboxError::runtime("collect_output", e))?;
            if self.push(frame, watch_eof) {
                debug!("EOF marker received, output complete");
                break;
            }
        }

        Ok(())
    }

    /// Appends a frame, returning true if it carried the EOF marker.
    fn push(&mut self, frame: LogOutput, watch_eof: bool) -> bool {
        let (buffer, message) = match frame {
            LogOutput::StdOut { message } => (&mut self.stdout, message),
            LogOutput::StdErr { message } => (&mut self.stderr, message),
            _ => return false,
        };

        let mut payload = &message[..];
        let eof = watch_eof && payload.last() == Some(&EOF_MARKER);
        if eof {
            payload = &payload[..payload.len() - 1];
        }
        buffer.extend_from_slice(payload);

        eof
    }
}

fn container_body(
    profile: &Profile,
    command: &Command,
    bindings: &Bindings,
    working_directory: &WorkingDirectory,
    envs: &[String],
    requires_stdin: bool,
) -> ContainerCreateBody {
    let mount = Mount {
        source: Some(working_directory.name().to_string()),
        target: Some(working_directory.path().to_string()),
        typ: Some(MountTypeEnum::VOLUME),
        volume_options: Some(MountVolumeOptions::default()),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(profile.image_name.clone()),
        cmd: Some(command.tokens().to_vec()),
        env: Some(envs.to_vec()),
        user: Some(profile.user.clone()),
        working_dir: Some(working_directory.path().to_string()),
        network_disabled: Some(profile.network_disabled),
        tty: Some(false),
        open_stdin: Some(requires_stdin),
        attach_stdin: Some(requires_stdin),
        stdin_once: Some(requires_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            mounts: Some(vec![mount]),
            binds: Some(bindings.to_binds()),
            cpu_count: Some(profile.limits.cpu_count),
            memory: Some(profile.limits.memory),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn write_stdin(attachment: &mut Attachment, payload: &str) -> std::io::Result<()> {
    attachment.input.write_all(payload.as_bytes()).await?;
    attachment.input.flush().await
}

/// `cat` alone, or `cat` followed by a flag, never exits while its input stays open.
fn waits_for_eof(command_text: &str) -> bool {
    let mut tokens = command_text.split_whitespace();
    tokens.next() == Some("cat") && tokens.next().is_none_or(|token| token.starts_with('-'))
}

/// The bytes written to a container's stdin for `command_text`.
fn stdin_payload(command_text: &str, stdin: &str) -> String {
    let mut payload = String::with_capacity(stdin.len() + 2);
    payload.push_str(stdin);
    payload.push('\n');
    if waits_for_eof(command_text) {
        payload.push(char::from(EOF_MARKER));
    }
    payload
}

fn exit_code(state: &ContainerState) -> i32 {
    state
        .exit_code
        .and_then(|code| i32::try_from(code).ok())
        .unwrap_or(RunResult::EXIT_CODE_UNKNOWN)
}

fn parse_timestamp(timestamp: Option<&str>) -> Option<DateTime<FixedOffset>> {
    timestamp
        .filter(|t| *t != UNSET_TIMESTAMP)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
}

/// Seconds between two runtime timestamps, NaN if either is missing or unset.
fn duration_seconds(started_at: Option<&str>, finished_at: Option<&str>) -> f64 {
    match (parse_timestamp(started_at), parse_timestamp(finished_at)) {
        (Some(started), Some(finished)) => {
            (finished - started).num_milliseconds() as f64 / 1000.0
        }
        _ => f64::NAN,
    }
}
