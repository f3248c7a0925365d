use std::error::Error;
use vergen::EmitBuilder;

fn main() -> Result<(), Box<dyn Error>> {
    // Git sha of the checkout, reported on `/info`
    if EmitBuilder::builder()
        .fail_on_error()
        .git_sha(true)
        .emit()
        .is_err()
    {
        // Container builds have no git checkout
        if let Ok(sha) = std::env::var("GIT_SHA") {
            println!("cargo:rustc-env=VERGEN_GIT_SHA={sha}");
        }
    }
    EmitBuilder::builder().build_timestamp().emit()?;
    Ok(())
}
