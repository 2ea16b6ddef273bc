use vidfetch::Config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vidfetch=info,tower_http=info".to_string()),
        )
        .init();

    let config = Config::from_env();

    if let Err(error) = vidfetch::serve(&config).await {
        eprintln!("Server error: {error:#}");
        std::process::exit(1);
    }
}
