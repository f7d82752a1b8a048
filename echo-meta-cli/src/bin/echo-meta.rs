use anyhow::Result;
use clap::Parser;
use echo_meta_cli::model;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cmd = model::RootCommand::parse();

    // RUST_LOG wins over the verbose flag
    let level = match cmd.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug!("Command parse result: {:?}", cmd);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let res = cmd.run(runtime.handle().clone());
    if let Err(e) = res.as_ref() {
        error!("{}", e);
    }
    res
}
