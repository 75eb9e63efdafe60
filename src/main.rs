use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = watchtower::cli::Cli::parse();
    if let Err(e) = watchtower::cmd::dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
