// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Opgate Server
//!
//! Serves the opgate gateway over MCP, on stdio or HTTP.

pub mod config;
pub mod mcp;

use anyhow::Result;
use axum::Router;
use config::{ServerConfig, TransportKind};
use mcp::{McpHandler, McpServer, StdioTransport};
use opgate_core::{BuiltinEngine, Gateway, RecipeManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Logs go to stderr so that stdout stays
/// reserved for protocol frames.
pub fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "opgate_server=info,opgate_core=info,tower_http=info".into());
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    // a subscriber may already be installed (tests, embedding)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init();
}

/// Build the gateway, open the recipe library and assemble the MCP handler.
pub async fn build_handler(config: &ServerConfig) -> Result<Arc<McpHandler>> {
    let gateway = Arc::new(Gateway::new(
        config.gateway.clone(),
        Arc::new(BuiltinEngine::new()),
    )?);
    gateway.initialize().await?;

    let recipes = Arc::new(RecipeManager::new(&config.gateway.recipes, gateway.clone()));
    recipes.initialize().await?;

    Ok(Arc::new(McpHandler::new(gateway, recipes)?))
}

/// HTTP application for a handler.
pub fn http_app(handler: Arc<McpHandler>, enable_cors: bool) -> Router {
    let cors = if enable_cors {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };
    McpServer::new(handler)
        .router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    init_tracing(config.server.log_json);

    tracing::info!("Starting Opgate Server");
    tracing::debug!("Configuration: {:#?}", config);

    config.validate()?;
    let handler = build_handler(&config).await?;

    let result = match config.server.transport {
        TransportKind::Stdio => {
            tracing::info!("MCP server reading from stdio");
            let mut transport = StdioTransport::stdio();
            mcp::serve(&handler, &mut transport, "stdio")
                .await
                .map_err(anyhow::Error::from)
        }
        TransportKind::Http => {
            let addr = config.socket_addr()?;
            let app = http_app(handler.clone(), config.server.enable_cors);
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("MCP Server listening on http://{}", addr);
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(anyhow::Error::from)
        }
    };

    handler.gateway().shutdown();
    tracing::info!("Opgate Server stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
