use dockbox_core::{EngineConfig, Limits, Profile};
use dockbox_engine::{Sandbox, Stdin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let profile = Profile::new("alpine", "alpine", "verify-timeout", "root")
        .with_limits(Limits::new(1, 64, 3));
    let config = EngineConfig::builder().profile(profile).build();
    let mut sandbox = Sandbox::builder().config(config).build()?;
    sandbox.start("/sandbox").await?;

    println!("Running 'sleep 10' with a 3s timeout (Expect timed out)...");
    match sandbox.run("alpine", "sleep 10", Stdin::None, &[]).await {
        Ok(result) => {
            println!("Result:\n{}", result);
            if result.timed_out {
                println!("PASS: Run timed out.");
            } else {
                println!("FAIL: Expected a timeout, got exit code {:?}", result.exit_code());
            }
        }
        Err(e) => {
            println!("ERROR: Run failed with error: {}", e);
            sandbox.cleanup().await?;
        }
    }

    sandbox.finish().await?;

    Ok(())
}
