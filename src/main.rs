//! To build a binary that can run from the initrd:
//! ```bash
//! CVM_UNLOCK_BUILD_STATIC=1 cargo build --release --target=x86_64-unknown-linux-musl
//! ```
use cvm_unlock::cli::Cli;
use eyre::Result;

fn main() -> Result<()> {
    let cli = Cli::new();
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    cli.run()?;
    Ok(())
}
