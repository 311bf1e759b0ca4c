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

use anyhow::Result;
use clap::Parser;
use opgate_server::{
    config::{ServerConfig, TransportKind},
    run_server,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "OPGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Transport to serve MCP on (stdio or http)
    #[arg(short, long)]
    transport: Option<TransportKind>,

    /// HTTP listen address (overrides config file)
    #[arg(long)]
    http_addr: Option<String>,

    /// Recipe library path (overrides config file)
    #[arg(long)]
    recipes: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = ServerConfig::load(args.config)?;

    // Apply CLI overrides
    if let Some(transport) = args.transport {
        config.server.transport = transport;
    }
    if let Some(addr) = args.http_addr {
        config.server.listen_addr = addr;
    }
    if let Some(path) = args.recipes {
        config.gateway.recipes.storage_path = path;
    }
    if args.log_json {
        config.server.log_json = true;
    }

    // Engine calls are bounded by the worker permits, not by the blocking
    // pool, which also serves file and stdio I/O.
    let workers = &config.gateway.workers;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_keep_alive(Duration::from_millis(workers.idle_timeout_ms))
        .build()?;

    runtime.block_on(run_server(config))
}
