use clap::Parser;
use ferryd::run_service;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "ferryd")]
#[command(about = "Resumable file-transfer server", long_about = None)]
#[command(version = VERSION)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    run_service(args.config.as_deref()).await
}
