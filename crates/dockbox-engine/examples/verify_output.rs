use dockbox_core::{Bindings, Command, EngineConfig, Limits, Profile, Shell};
use dockbox_engine::{DockerRuntime, Engine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let runtime = DockerRuntime::connect(&EngineConfig::default())?;
    let mut engine = Engine::with_runtime(Shell::Sh, Arc::new(runtime));
    let profile = Profile::new("alpine", "alpine", "verify-output", "root")
        .with_limits(Limits::new(1, 64, 5));
    engine.add_profiles([profile]);

    let mut directory = engine.open("/sandbox").await?;

    println!("Piping 'Hello from dockbox' through cat (Expect it echoed back)...");
    let mut command = Command::new("cat");
    let id = engine
        .create_container(
            "alpine",
            &mut command,
            &Bindings::new(),
            &directory,
            Some("Hello from dockbox"),
            &[],
        )
        .await?;
    engine.start_container(&id).await?;
    let result = engine.get_result(&id).await?;

    println!("Stdout: {:?}", result.stdout);

    if result.stdout == "Hello from dockbox\n" && !result.timed_out {
        println!("PASS: Output matches stdin.");
    } else {
        println!("FAIL: Output does not match stdin.");
    }

    engine.remove_container(&id).await?;
    directory.close().await?;

    Ok(())
}
