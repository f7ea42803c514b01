//! Federator service: FDSN web-service gateway.
//!
//! Receives `dataselect`, `station` and `wfcatalog` queries, resolves them
//! against the routing service and merges the answers of every matching
//! archive node into one streamed response.
//!
//! # Configuration
//! Read from the environment (a `.env` file is honoured).
//!
//! | Env var                          | Default                                            |
//! |----------------------------------|----------------------------------------------------|
//! | `FEDERATOR_ADDR`                 | `0.0.0.0:8080`                                     |
//! | `FEDERATOR_BASE_URL`             | `/fdsnws`                                          |
//! | `FEDERATOR_NAME`                 | `federator`                                        |
//! | `FEDERATOR_SOURCE`               | `EIDA`                                             |
//! | `FEDERATOR_SENDER`               | `ORFEUS`                                           |
//! | `FEDERATOR_DOCUMENTATION_URI`    | `http://www.orfeus-eu.org/data/eida/webservices/`  |
//! | `FEDERATOR_SERVICE_CLOSED`       | `false`                                            |
//! | `FEDERATOR_MAX_QUERY_BYTES`      | `4096`                                             |
//! | `FEDERATOR_JSON_SEPARATE_NODES`  | `false`                                            |
//! | `ROUTING_URL`                    | `http://www.orfeus-eu.org/eidaws/routing/1/query`  |
//! | `FEDERATOR_MAX_THREADS`          | `8`                                                |
//! | `FEDERATOR_THREAD_TIMEOUT_MS`    | `120000`                                           |
//! | `FEDERATOR_ROUTING_TIMEOUT_MS`   | `30000`                                            |
//! | `FEDERATOR_MAX_BYTES_FLUSH`      | `8388608`                                          |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use federator::{config::ServerConfig, router, AppState};
use federator_core::ReqwestTransport;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("federator=info".parse()?)
                .add_directive("federator_core=info".parse()?),
        )
        .json()
        .init();

    let config = Arc::new(ServerConfig::from_env());
    let transport = ReqwestTransport::new(&config.federator.user_agent)?;

    info!(
        routing_url = config.federator.routing_url,
        base_url = config.base_url,
        max_threads = config.federator.max_threads,
        closed = config.service_closed,
        "federator configured"
    );

    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        transport: Arc::new(transport),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!(addr = config.addr, "federator listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
