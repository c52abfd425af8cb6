pub mod docker;
pub mod engine;
pub mod session;
pub mod tracker;
pub mod traits;
pub mod working_dir;

pub use docker::DockerRuntime;
pub use engine::{Engine, EOF_MARKER};
pub use session::{Sandbox, SandboxBuilder, Stdin};
pub use tracker::SharedTracker;
pub use traits::{ArchiveStream, Attachment, ContainerRuntime, OutputStream, StdinWriter};
pub use working_dir::WorkingDirectory;
