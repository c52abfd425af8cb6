use dockbox_core::{EngineConfig, Limits, Profile, UploadedFile};
use dockbox_engine::{Sandbox, Stdin};
use std::path::Path;

const SOURCE: &str = r#"#include <stdio.h>
int main() { int a, b; scanf("%d %d", &a, &b); printf("%d\n", a + b); }
"#;

async fn compile_and_run(
    sandbox: &mut Sandbox,
    source: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Compiling main.c...");
    let compiled = sandbox
        .run(
            "gcc",
            "gcc main.c -o main",
            Stdin::None,
            &[UploadedFile::new("main.c", source)],
        )
        .await?;
    println!("Result:\n{}", compiled);

    println!("Running ./main with '2 3'...");
    let result = sandbox
        .run("gcc", "./main", Stdin::Text("2 3".into()), &[])
        .await?;
    println!("Result:\n{}", result);

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let source = std::env::temp_dir().join("dockbox-simple.c");
    std::fs::write(&source, SOURCE)?;

    let profile = Profile::new("gcc", "gcc", "dockbox-simple", "root")
        .with_limits(Limits::new(1, 256, 20));
    let config = EngineConfig::builder().profile(profile).build();
    let mut sandbox = Sandbox::builder().config(config).build()?;

    println!("Starting sandbox...");
    sandbox.start("/sandbox").await?;

    let outcome = compile_and_run(&mut sandbox, &source).await;
    if outcome.is_err() {
        sandbox.cleanup().await?;
    }
    sandbox.finish().await?;

    outcome
}
