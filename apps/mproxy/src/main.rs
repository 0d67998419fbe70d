use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, ConfigFile};
use mproxy_common::GlobalConfigPatch;
use mproxy_core::bootstrap::{bootstrap, BootConfig};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let file = match load_config_file(cli.config.as_deref()) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };

    // Merge order: CLI > env (clap env fallbacks) > config file.
    let mut patch = GlobalConfigPatch::default();
    patch.overlay(file.global_patch());
    patch.overlay(cli.global_patch());
    let global = match patch.into_config() {
        Ok(global) => global,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::from(2);
        }
    };

    let bind = format!("{}:{}", global.host, global.port);
    let resolver_tables = file.resolver_tables();
    let rules = file.payload_rules();
    let boot = BootConfig {
        global,
        providers: file.providers,
        resolver_tables,
        rules,
    };

    let runtime = match bootstrap(boot).await {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "startup failed");
            return ExitCode::from(1);
        }
    };

    let app = axum::Router::new()
        .merge(mproxy_router::proxy_router(runtime.engine.clone()))
        .nest(
            "/v0/management",
            mproxy_router::management_router(runtime.state.clone()),
        );

    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %bind, "failed to bind");
            return ExitCode::from(1);
        }
    };
    tracing::info!(%bind, clients = runtime.state.pool.len(), "mproxy listening");

    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(%err, "server error");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn load_config_file(path: Option<&str>) -> Result<ConfigFile, String> {
    let Some(path) = path else {
        return Ok(ConfigFile::default());
    };
    let data = std::fs::read(path).map_err(|err| format!("cannot read {path}: {err}"))?;
    serde_json::from_slice(&data).map_err(|err| format!("cannot parse {path}: {err}"))
}
