use dockbox_core::{
    Bindings, Command, DockboxError, EngineConfig, Result, RunResult, UploadedFile,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::tracker::{self, SharedTracker};
use crate::traits::ContainerRuntime;
use crate::working_dir::WorkingDirectory;

/// Exit status used when the process is torn down by a termination signal.
const SIGNAL_EXIT_CODE: i32 = 130;

/// Where a run's standard input comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Stdin {
    #[default]
    None,
    Text(String),
    File(PathBuf),
}

impl Stdin {
    async fn read(self) -> Result<Option<String>> {
        match self {
            Stdin::None => Ok(None),
            Stdin::Text(text) => Ok(Some(text)),
            Stdin::File(path) => Ok(Some(tokio::fs::read_to_string(&path).await?)),
        }
    }
}

impl From<Option<String>> for Stdin {
    fn from(text: Option<String>) -> Self {
        text.map_or(Stdin::None, Stdin::Text)
    }
}

/// Builds a [`Sandbox`] from configuration plus session-wide bindings and environment.
#[derive(Default)]
pub struct SandboxBuilder {
    config: Option<EngineConfig>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    bindings: Bindings,
    raw_bindings: Vec<String>,
    envs: Vec<String>,
}

impl SandboxBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `runtime` instead of connecting to the configured daemon.
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Adds a `local:remote` binding, validated when the sandbox is built.
    pub fn binding(mut self, binding: impl Into<String>) -> Self {
        self.raw_bindings.push(binding.into());
        self
    }

    pub fn bindings(mut self, bindings: Bindings) -> Self {
        self.bindings.extend(bindings);
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push(format!("{}={}", key, value));
        self
    }

    pub fn envs(mut self, envs: impl IntoIterator<Item = String>) -> Self {
        self.envs.extend(envs);
        self
    }

    pub fn build(self) -> Result<Sandbox> {
        let mut bindings = self.bindings;
        for raw in &self.raw_bindings {
            bindings.add_binding(raw)?;
        }

        let config = self.config.unwrap_or_default();
        let engine = match self.runtime {
            Some(runtime) => {
                let mut engine = Engine::with_runtime(config.shell, runtime);
                engine.add_profiles(config.profiles.iter().cloned());
                engine
            }
            None => Engine::connect(&config)?,
        };

        Ok(Sandbox {
            engine,
            bindings,
            envs: self.envs,
            working_directory: None,
            hook: None,
        })
    }
}

/// One session of runs sharing a working directory.
///
/// `start` opens the directory, `run` executes commands in it, and `finish`
/// removes it. A termination signal between `start` and `finish` removes the
/// session's containers and volume before the process exits.
pub struct Sandbox {
    engine: Engine,
    bindings: Bindings,
    envs: Vec<String>,
    working_directory: Option<WorkingDirectory>,
    hook: Option<ShutdownHook>,
}

impl Sandbox {
    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::default()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn working_directory(&self) -> Option<&WorkingDirectory> {
        self.working_directory.as_ref()
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn envs(&self) -> &[String] {
        &self.envs
    }

    /// Opens the working directory mounted at `path` and arms the shutdown hook.
    pub async fn start(&mut self, path: impl Into<String>) -> Result<()> {
        if let Some(directory) = &self.working_directory {
            return Err(DockboxError::WorkingDirectoryActive(
                directory.name().to_string(),
            ));
        }

        let directory = self.engine.open(path).await?;
        self.hook = Some(ShutdownHook::install(
            self.engine.runtime(),
            self.engine.tracker(),
            directory.name().to_string(),
        ));
        info!("Sandbox started in {}", directory.name());
        self.working_directory = Some(directory);

        Ok(())
    }

    /// Runs `command` under `profile` and removes its container afterwards.
    ///
    /// `files` are staged into the working directory before the container
    /// starts. A failure part way leaves the container behind for [`Sandbox::cleanup`].
    pub async fn run(
        &mut self,
        profile: &str,
        command: impl Into<Command>,
        stdin: Stdin,
        files: &[UploadedFile],
    ) -> Result<RunResult> {
        let directory = self
            .working_directory
            .as_ref()
            .ok_or(DockboxError::NotStarted)?;

        let stdin = stdin.read().await?;
        let mut command = command.into();

        let id = self
            .engine
            .create_container(
                profile,
                &mut command,
                &self.bindings,
                directory,
                stdin.as_deref(),
                &self.envs,
            )
            .await?;
        directory.add_files(&id, files).await?;
        self.engine.start_container(&id).await?;

        let result = self.engine.get_result(&id).await?;
        self.engine.remove_container(&id).await?;

        Ok(result)
    }

    /// Closes the working directory and disarms the shutdown hook.
    ///
    /// Calling it again, or before `start`, does nothing.
    pub async fn finish(&mut self) -> Result<()> {
        let Some(directory) = self.working_directory.as_mut() else {
            return Ok(());
        };

        if let Some(hook) = &self.hook {
            if !hook.claim() {
                debug!("Shutdown hook is already tearing the sandbox down");
                return Ok(());
            }
        }

        if let Err(e) = directory.close().await {
            if let Some(hook) = &self.hook {
                hook.release();
            }
            return Err(e);
        }

        self.working_directory = None;
        self.hook = None;
        info!("Sandbox finished");

        Ok(())
    }

    /// Removes every container this session created that still exists.
    pub async fn cleanup(&mut self) -> Result<usize> {
        self.engine.cleanup_containers().await
    }
}

/// Background task that tears a sandbox down when the process is asked to stop.
pub struct ShutdownHook {
    task: JoinHandle<()>,
    claimed: Arc<AtomicBool>,
}

impl ShutdownHook {
    fn install(runtime: Arc<dyn ContainerRuntime>, tracker: SharedTracker, volume: String) -> Self {
        let claimed = Arc::new(AtomicBool::new(false));
        let flag = claimed.clone();

        let task = tokio::spawn(async move {
            if !wait_for_termination().await {
                return;
            }
            if flag
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }

            warn!("Termination requested, removing sandbox containers and volume {}", volume);
            if let Err(e) = tracker::reclaim(runtime.as_ref(), &tracker).await {
                error!("Failed to remove containers: {}", e);
            }
            if let Err(e) = runtime.remove_volume(&volume).await {
                error!("Failed to remove volume {}: {}", volume, e);
            }

            std::process::exit(SIGNAL_EXIT_CODE);
        });

        Self { task, claimed }
    }

    /// Takes the right to tear down. Returns false if the hook already has it.
    fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self) {
        self.claimed.store(false, Ordering::SeqCst);
    }
}

impl Drop for ShutdownHook {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Resolves true once Ctrl-C or SIGTERM arrives, false if no handler could be installed.
async fn wait_for_termination() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!("Could not listen for SIGTERM: {}", e);
                return tokio::signal::ctrl_c().await.is_ok();
            }
        };

        tokio::select! {
            result = tokio::signal::ctrl_c() => result.is_ok(),
            _ = terminate.recv() => true,
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.is_ok()
    }
}
