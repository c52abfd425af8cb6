use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use dockbox_core::{EngineConfig, RunResult, UploadedFile};
use dockbox_engine::{Sandbox, Stdin};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "dockbox")]
#[command(about = "Run commands in resource-limited Docker containers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command under a profile
    Run {
        /// Configuration file (default: ./dockbox.{toml,json,yaml})
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Mount path of the working directory inside the container
        #[arg(short, long, default_value = "/sandbox")]
        workdir: String,
        /// Profile to run under
        #[arg(short, long)]
        profile: String,
        /// File whose contents are sent to stdin
        #[arg(long, conflicts_with = "input")]
        stdin: Option<PathBuf>,
        /// Text sent to stdin
        #[arg(long)]
        input: Option<String>,
        /// File or directory copied into the working directory first
        #[arg(short, long)]
        upload: Vec<PathBuf>,
        /// Host path bound into the container, as local:remote
        #[arg(short, long)]
        bind: Vec<String>,
        /// Environment variable, as KEY=VALUE
        #[arg(short, long)]
        env: Vec<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
        /// Command line run by the shell
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// List configured profiles
    Profiles {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => EngineConfig::new()?,
    };
    info!("Loaded {} profiles", config.profiles.len());
    Ok(config)
}

fn print_result(result: &RunResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let heading = if result.timed_out {
        "Timed Out".yellow().bold()
    } else if result.out_of_memory {
        "Out Of Memory".red().bold()
    } else if result.success() {
        "Execution Result".green().bold()
    } else {
        "Execution Failed".red().bold()
    };
    println!("{}", heading);
    println!("{}", result);

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "dockbox_engine=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            workdir,
            profile,
            stdin,
            input,
            upload,
            bind,
            env,
            json,
            command,
        } => {
            let config = load_config(config.as_ref())?;
            let mut builder = Sandbox::builder().config(config).envs(env);
            for binding in bind {
                builder = builder.binding(binding);
            }
            let mut sandbox = builder.build()?;

            let stdin = match (stdin, input) {
                (Some(path), _) => Stdin::File(path),
                (None, input) => Stdin::from(input),
            };
            let files: Vec<UploadedFile> = upload.iter().map(UploadedFile::from_path).collect();

            sandbox.start(workdir).await?;
            let outcome = sandbox
                .run(&profile, command.join(" ").as_str(), stdin, &files)
                .await;

            if outcome.is_err() {
                match sandbox.cleanup().await {
                    Ok(removed) => info!("Removed {} leftover containers", removed),
                    Err(e) => error!("Cleanup failed: {}", e),
                }
            }
            sandbox.finish().await?;

            let result = outcome?;
            print_result(&result, json)?;
            if !result.success() {
                std::process::exit(result.exit_code().filter(|code| *code != 0).unwrap_or(1));
            }
        }
        Commands::Profiles { config } => {
            let config = load_config(config.as_ref())?;
            if config.profiles.is_empty() {
                println!("No profiles configured.");
            }

            for profile in &config.profiles {
                println!("> {}", profile.profile_name.bold());
                println!("    image      {}", profile.image_name);
                println!("    container  {}", profile.container_name);
                println!("    user       {}", profile.user);
                println!(
                    "    limits     {} cpus, {} bytes, {}s",
                    profile.limits.cpu_count, profile.limits.memory, profile.limits.timeout
                );
                if profile.network_disabled {
                    println!("    network    {}", "disabled".red());
                }
            }
        }
    }

    Ok(())
}
