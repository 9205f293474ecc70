use clap::Parser;
use mqrpc::RpcConfig;

/// Serve the demo calculator over an in-process broker and exercise it.
#[derive(Parser, Debug)]
#[command(name = "mqrpcd", version, about)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = match cli.config.as_deref() {
        Some(path) => RpcConfig::from_path(path)?,
        None => RpcConfig::default(),
    };
    config.validate()?;

    let report = mqrpcd::run_demo(config).await?;
    println!("add(2, 40) = {}", report.sum);
    println!("divide(1, 4) = {}", report.quotient);
    if let Some(message) = &report.rejected_division {
        println!("divide(1, 0) rejected: {message}");
    }
    for entry in &report.audited {
        println!("audit: {} {}", entry.operation, entry.detail);
    }
    Ok(())
}
