use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // JOBFLOW_LOG takes precedence over RUST_LOG
    let filter = EnvFilter::try_from_env("JOBFLOW_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = jobflow::cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
