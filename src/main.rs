use clap::Parser;
use dotenv::dotenv;
use log::error;

use polychat::cli::Args;

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if let Err(e) = polychat::run(args).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
