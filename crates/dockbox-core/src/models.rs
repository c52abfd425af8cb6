use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{DockboxError, Result};

/// Resource limits applied to every container created under a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "LimitsConfig")]
pub struct Limits {
    pub cpu_count: i64,
    /// Memory limit in bytes.
    pub memory: i64,
    /// Wall-clock bound, in seconds, on waiting for a container's output.
    pub timeout: u64,
}

impl Limits {
    pub const CPU_COUNT_DEFAULT: i64 = 4;
    pub const MEMORY_MB_DEFAULT: i64 = 64;
    pub const TIMEOUT_DEFAULT: u64 = 3;

    const BYTES_PER_MB: i64 = 1_000_000;

    /// Builds limits from a memory value given in MB. Values past `i64::MAX`
    /// bytes are clamped.
    pub fn new(cpu_count: i64, memory_mb: i64, timeout: u64) -> Self {
        Self {
            cpu_count,
            memory: memory_mb.saturating_mul(Self::BYTES_PER_MB),
            timeout,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new(
            Self::CPU_COUNT_DEFAULT,
            Self::MEMORY_MB_DEFAULT,
            Self::TIMEOUT_DEFAULT,
        )
    }
}

/// Limits as written in configuration files, memory in MB.
///
/// The camel-case spellings are accepted for older profile files. Key
/// lookups through the `config` crate arrive lower-cased.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LimitsConfig {
    #[serde(alias = "cpuCount", alias = "cpucount")]
    cpu_count: Option<i64>,
    memory: Option<i64>,
    timeout: Option<u64>,
}

impl From<LimitsConfig> for Limits {
    fn from(raw: LimitsConfig) -> Self {
        Limits::new(
            raw.cpu_count.unwrap_or(Limits::CPU_COUNT_DEFAULT),
            raw.memory.unwrap_or(Limits::MEMORY_MB_DEFAULT),
            raw.timeout.unwrap_or(Limits::TIMEOUT_DEFAULT),
        )
    }
}

/// A named, reusable container configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "ProfileConfig")]
pub struct Profile {
    pub profile_name: String,
    pub image_name: String,
    pub container_name: String,
    pub user: String,
    pub limits: Limits,
    pub network_disabled: bool,
}

impl Profile {
    pub fn new(
        profile_name: impl Into<String>,
        image_name: impl Into<String>,
        container_name: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            profile_name: profile_name.into(),
            image_name: image_name.into(),
            container_name: container_name.into(),
            user: user.into(),
            limits: Limits::default(),
            network_disabled: false,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network_disabled(mut self, network_disabled: bool) -> Self {
        self.network_disabled = network_disabled;
        self
    }
}

const IMAGE_UNSPECIFIED: &str = "NO-IMAGE-SPECIFIED";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileConfig {
    name: String,
    image: Option<String>,
    #[serde(alias = "container-name")]
    container_name: Option<String>,
    user: Option<String>,
    limits: Option<Limits>,
    #[serde(default, alias = "networkDisabled", alias = "networkdisabled")]
    network_disabled: bool,
}

impl From<ProfileConfig> for Profile {
    fn from(raw: ProfileConfig) -> Self {
        let image = raw.image.unwrap_or_else(|| IMAGE_UNSPECIFIED.to_string());
        // Containers are named after their image unless told otherwise
        let container_name = raw.container_name.unwrap_or_else(|| image.clone());

        Profile {
            profile_name: raw.name,
            image_name: image,
            container_name,
            user: raw.user.unwrap_or_else(|| "root".to_string()),
            limits: raw.limits.unwrap_or_default(),
            network_disabled: raw.network_disabled,
        }
    }
}

/// The shell every command is run under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Shell {
    #[default]
    Sh,
    Bash,
}

impl Shell {
    pub fn binary(&self) -> String {
        format!("/bin/{}", self)
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shell::Sh => write!(f, "sh"),
            Shell::Bash => write!(f, "bash"),
        }
    }
}

impl FromStr for Shell {
    type Err = DockboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sh" => Ok(Shell::Sh),
            "bash" => Ok(Shell::Bash),
            _ => Err(DockboxError::UnknownShell(s.to_string())),
        }
    }
}

/// A command line as a list of tokens.
///
/// Callers build it from the literal command text; the engine later prepends
/// the shell prologue (`/bin/<shell> -c`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    tokens: Vec<String>,
}

impl Command {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            tokens: vec![command.into()],
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.tokens
    }

    /// Prepends `/bin/<shell> -c` so the command text is interpreted by the shell.
    pub fn prepend_shell(&mut self, shell: Shell) {
        self.tokens.insert(0, shell.binary());
        self.tokens.insert(1, "-c".to_string());
    }

    /// The literal command text, with or without the shell prologue in front.
    pub fn text(&self) -> &str {
        match self.tokens.as_slice() {
            [_, flag, text, ..] if flag == "-c" => text.as_str(),
            [text, ..] => text.as_str(),
            [] => "",
        }
    }
}

impl From<&str> for Command {
    fn from(command: &str) -> Self {
        Command::new(command)
    }
}

/// A host path bound into a container, written as `local:remote`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub local: String,
    pub remote: String,
}

impl Binding {
    pub fn new(local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

impl FromStr for Binding {
    type Err = DockboxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(remote), None) => Ok(Binding::new(local, remote)),
            _ => Err(DockboxError::InvalidBinding(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings(Vec<Binding>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, binding: Binding) -> &mut Self {
        self.0.push(binding);
        self
    }

    /// Parses and appends a `local:remote` binding.
    pub fn add_binding(&mut self, binding: &str) -> Result<&mut Self> {
        let binding = binding.parse()?;
        Ok(self.add(binding))
    }

    pub fn extend(&mut self, other: Bindings) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Binding> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The bindings in the runtime's `local:remote` bind format.
    pub fn to_binds(&self) -> Vec<String> {
        self.0.iter().map(Binding::to_string).collect()
    }
}

impl FromIterator<Binding> for Bindings {
    fn from_iter<I: IntoIterator<Item = Binding>>(iter: I) -> Self {
        Bindings(iter.into_iter().collect())
    }
}

/// A host file or directory to stage into a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Entry name inside the working directory.
    pub name: String,
    pub path: PathBuf,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// Uses the final component of `path` as the entry name.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::new(name, path)
    }
}

/// Outcome of a single container run.
///
/// When `timed_out` is set, `stdout` and `stderr` hold whatever was collected
/// before the deadline and may be incomplete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub out_of_memory: bool,
    pub timed_out: bool,
    /// Seconds between start and finish, NaN when the runtime did not report both.
    pub duration: f64,
}

impl RunResult {
    /// Exit code reported when the runtime could not provide one.
    pub const EXIT_CODE_UNKNOWN: i32 = i32::MIN;

    pub fn exit_code(&self) -> Option<i32> {
        (self.exit_code != Self::EXIT_CODE_UNKNOWN).then_some(self.exit_code)
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.out_of_memory
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code() {
            Some(code) => writeln!(f, "Exit Code: {}", code)?,
            None => writeln!(f, "Exit Code: unknown")?,
        }
        writeln!(f, "Stdout:\n{}", self.stdout)?;
        writeln!(f, "Stderr:\n{}", self.stderr)?;
        writeln!(f, "OOM: {}", self.out_of_memory)?;
        writeln!(f, "Timed Out: {}", self.timed_out)?;

        if self.duration.is_nan() {
            writeln!(f, "Duration: unknown")?;
        } else {
            writeln!(f, "Duration: {:.3} s", self.duration)?;
        }

        Ok(())
    }
}
