use dockbox_core::{EngineConfig, Limits, Profile};
use dockbox_engine::{Sandbox, Stdin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let profile = Profile::new("perl", "perl:slim", "verify-memory", "root")
        .with_limits(Limits::new(1, 64, 10));
    let config = EngineConfig::builder().profile(profile).build();
    let mut sandbox = Sandbox::builder().config(config).build()?;
    sandbox.start("/sandbox").await?;

    println!("Running Memory Hog with a 64 MB limit (Expect out of memory)...");
    let result = sandbox
        .run(
            "perl",
            "perl -e '$a = \"x\" x (512 * 1024 * 1024);'",
            Stdin::None,
            &[],
        )
        .await;

    match result {
        Ok(res) => {
            println!("Result:\n{}", res);
            if res.out_of_memory {
                println!("PASS: Container was OOM killed.");
            } else {
                println!("FAIL: Expected an OOM kill, got exit code {:?}", res.exit_code());
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
