use clap::Parser;
use mingpt_pile::cli::{self, Args};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let plot = cli::run(&args)?;
    println!("loss curve written to {}", plot.display());
    Ok(())
}
