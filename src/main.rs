//! chunk-relay server binary.
//!
//! Browsers push files in chunks, the server reassembles them on local disk
//! and relays each finished file to a WebDAV share, grouping the files of one
//! submission into a single folder with a contact note.

mod assemble;
mod background;
mod chunks;
mod config;
mod error;
mod finalize;
mod frontend;
mod http;
mod logging;
mod remote;
mod sessions;
#[cfg(test)]
mod testing;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span, warn};

use crate::background::spawn_background_tasks;
use crate::chunks::ChunkStore;
use crate::config::{Args, MULTIPART_OVERHEAD};
use crate::finalize::Uploader;
use crate::http::{build_cors_layer, client_ip};
use crate::remote::WebDavClient;
use crate::sessions::SessionRegistry;
use crate::upload::UploadConfig;

shadow!(build);

/// 组装全部路由与共享状态。
fn build_router(uploader: Arc<Uploader>, upload_config: Arc<UploadConfig>) -> Router {
    let chunk_limit = usize::try_from(upload_config.chunk_max_size.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(frontend::serve_form))
        .route("/upload-session", post(upload::open_session))
        .route(
            "/upload-chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
        )
        .route("/upload-complete", post(upload::complete_upload))
        .fallback(frontend::serve_asset)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(Extension(uploader))
        .layer(Extension(upload_config))
}

/// Starts the relay server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let chunks = ChunkStore::new(PathBuf::from(&args.temp_dir));
    chunks.ensure_root().await?;

    let remote = match WebDavClient::new(args.remote_config()) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "invalid remote configuration");
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                err.to_string(),
            ));
        }
    };
    let sessions = Arc::new(SessionRegistry::new());
    let uploader = Arc::new(Uploader::new(
        chunks.clone(),
        Arc::new(remote),
        sessions.clone(),
        args.note_name.clone(),
    ));
    let upload_config = Arc::new(UploadConfig {
        chunk_max_size: args.chunk_max_size,
    });

    let mut app = build_router(uploader, upload_config).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    client_ip = client_ip(request),
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(
        remote = args.nc_url,
        folder = args.nc_folder,
        scratch = args.temp_dir,
        "starting upload relay at {}",
        addr
    );

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        chunks,
        sessions,
        Duration::from_secs(args.session_ttl_secs),
        Duration::from_secs(args.scratch_ttl_secs),
    );
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
