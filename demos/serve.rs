//! Serves a directory with resumable downloads.
//!
//! ```text
//! cargo run --example serve -- application.toml local.toml
//! curl -H 'Range: bytes=500-' http://127.0.0.1:3000/files/some/file.bin
//! ```
//!
//! Settings come from the listed files, then `RESUME_*` variables
//! (`RESUME_SERVER__ROOT=/srv/files`).

use axum_resume::config::{Properties, Settings};
use axum_resume::{router, LocalFileStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let files: Vec<String> = std::env::args().skip(1).collect();
    let properties = Properties::load(&files[..])?;
    let settings = Settings::from_properties(&properties)?;

    let app = router(
        LocalFileStore::new(&settings.server.root),
        settings.download_options(),
    );

    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    info!(
        addr = %listener.local_addr()?,
        root = %settings.server.root.display(),
        "serving downloads"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
