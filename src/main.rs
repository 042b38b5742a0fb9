use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use log::{error, info, warn};
use warp::Filter;

use room_hub::auth::TokenAuthority;
use room_hub::config::Config;
use room_hub::directory::InMemoryRoomDirectory;
use room_hub::routes;
use room_hub::server::Server;
use room_hub::store::InMemoryMessageStore;

/// Checks that the certificate and key parse before handing the paths to warp,
/// which would otherwise panic on a bad file.
fn tls_usable(cert_path: &Path, key_path: &Path) -> bool {
    let cert_file = match File::open(cert_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open certificate file {}: {}", cert_path.display(), e);
            return false;
        }
    };
    let key_file = match File::open(key_path) {
        Ok(file) => file,
        Err(e) => {
            warn!("Failed to open private key file {}: {}", key_path.display(), e);
            return false;
        }
    };

    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file)).collect::<Result<Vec<_>, _>>();
    match certs {
        Ok(certs) if !certs.is_empty() => {}
        Ok(_) => {
            warn!("No certificates found in {}", cert_path.display());
            return false;
        }
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            return false;
        }
    }

    match rustls_pemfile::private_key(&mut BufReader::new(key_file)) {
        Ok(Some(_)) => true,
        Ok(None) => {
            warn!("No private key found in {}", key_path.display());
            false
        }
        Err(e) => {
            warn!("Failed to parse private key: {}", e);
            false
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let server = Server::new(
        &config,
        Arc::new(
            TokenAuthority::new(config.token_secret()).with_ttl(i64::from(config.token_ttl_secs)),
        ),
        Arc::new(InMemoryRoomDirectory::new()),
        Arc::new(InMemoryMessageStore::new()),
    );

    let routes = routes::routes(server.clone())
        .with(warp::cors().allow_any_origin())
        .with(warp::log("room_hub::http"));

    let shutdown = {
        let server = server.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            server.shutdown().await;
        }
    };

    let tls = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) if tls_usable(cert, key) => Some((cert.clone(), key.clone())),
        (Some(_), Some(_)) => {
            warn!("TLS files unusable, falling back to HTTP/WS");
            None
        }
        _ => None,
    };

    match tls {
        Some((cert, key)) => {
            let (addr, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(config.addr(), shutdown);
            info!("Starting secure server (HTTPS/WSS) on {}", addr);
            serving.await;
        }
        None => {
            let (addr, serving) =
                match warp::serve(routes).try_bind_with_graceful_shutdown(config.addr(), shutdown) {
                    Ok(bound) => bound,
                    Err(e) => {
                        error!("Failed to bind {}: {}", config.addr(), e);
                        std::process::exit(1);
                    }
                };
            info!("Starting server (HTTP/WS) on {}", addr);
            serving.await;
        }
    }
}
