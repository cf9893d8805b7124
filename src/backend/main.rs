/**
 * hubsync Server Entry Point
 *
 * Loads configuration, starts the hub and the sync engine, and serves the
 * Axum router until Ctrl-C.
 */

#[cfg(feature = "ssr")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenv::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&env_filter))
        .init();

    tracing::info!("[Server] Startup, RUST_LOG={}", env_filter);

    let config = hubsync::shared::AppConfig::load()?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let app = hubsync::backend::server::init::create_app(config).await?;

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("[Server] Listening on {}", addr);

    // Sockets stay open until the hub detaches them
    let router = app.router.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            app.shutdown().await;
        })
        .await?;

    tracing::info!("[Server] Stopped");
    Ok(())
}

#[cfg(feature = "ssr")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("[Server] Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("[Server] Ctrl-C received");
}

#[cfg(not(feature = "ssr"))]
fn main() {
    eprintln!("Server requires the 'ssr' feature to be enabled.");
    eprintln!("Run with: cargo run --bin hubsync-server --features ssr");
    std::process::exit(1);
}
