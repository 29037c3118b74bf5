//! Server entry point: binds the fixed ports, restores `canvas.json`
//! from the working directory, and serves until killed. Exits non-zero
//! when the reliable port cannot be bound.

use fresco::{Server, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let server = Server::new(ServerConfig::default());
    match server.serve().await {
        Ok(addr) => {
            log::info!("fresco server ready on {addr}");
            std::future::pending::<()>().await;
        }
        Err(e) => {
            log::error!("startup failed: {e}");
            std::process::exit(1);
        }
    }
}
