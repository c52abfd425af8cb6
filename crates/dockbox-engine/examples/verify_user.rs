use dockbox_core::{EngineConfig, Profile};
use dockbox_engine::{Sandbox, Stdin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig::builder()
        .profile(Profile::new("alpine", "alpine", "verify-user", "nobody"))
        .build();
    let mut sandbox = Sandbox::builder().config(config).build()?;
    sandbox.start("/sandbox").await?;

    println!("Running 'id' as user nobody (Expect uid=65534(nobody))...");

    match sandbox.run("alpine", "id", Stdin::None, &[]).await {
        Ok(result) => {
            println!("Stdout: {}", result.stdout);
            if result.stdout.contains("uid=65534") {
                println!("PASS: Process ran as nobody.");
            } else {
                println!("FAIL: Process did NOT run as nobody.");
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
