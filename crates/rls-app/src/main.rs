//! Process entry point. Parses CLI flags, loads configuration, wires the
//! two gRPC servers (ext_authz and rate-limit) and the overrides sync
//! controller onto [`rls::AppState`], and drives graceful shutdown via
//! `rls_core::signal`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tonic::transport::Server;

use rls::config::Config;
use rls::grpc::authz::AuthzService;
use rls::grpc::ratelimit::RatelimitService;
use rls::sync::source::FileSource;
use rls::sync::{SyncController, ready_channel, staleness_channel};
use rls::AppState;
use rls_protos::envoy::service::auth::v3::authorization_server::AuthorizationServer;
use rls_protos::envoy::service::ratelimit::v3::rate_limit_service_server::RateLimitServiceServer;

#[derive(Debug, Parser)]
#[command(name = "rls", about = "Multi-tenant edge rate-limit and admission-control service")]
struct Args {
    /// Path to the process configuration YAML.
    #[arg(long, env = "RLS_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the tenant overrides YAML. Overrides sync is disabled if unset.
    #[arg(long, env = "RLS_OVERRIDES")]
    overrides: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rls_core::telemetry::init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    tracing::info!(build = %rls_core::version::BuildInfo::current(), "starting rls");

    let state = AppState::new(config.clone());

    let (shutdown_trigger, authz_drain) = rls_core::signal::new();
    let ratelimit_drain = authz_drain.clone();
    let sync_drain = authz_drain.clone();

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter.set_not_serving::<AuthorizationServer<AuthzService>>().await;
    health_reporter.set_not_serving::<RateLimitServiceServer<RatelimitService>>().await;

    let (ready_tx, mut ready_rx) = ready_channel();
    let (staleness_tx, _staleness_rx) = staleness_channel();

    if let Some(path) = args.overrides {
        let source = Arc::new(FileSource::new(path));
        let controller = SyncController::new(source, state.clone());
        tokio::spawn(controller.run(ready_tx, staleness_tx, sync_drain));
    } else {
        // No override source configured: the default limits are the whole
        // story, so the service is ready immediately.
        let _ = ready_tx.send(true);
    }

    {
        let health_reporter = health_reporter.clone();
        tokio::spawn(async move {
            if ready_rx.changed().await.is_ok() && *ready_rx.borrow() {
                health_reporter.set_serving::<AuthorizationServer<AuthzService>>().await;
                health_reporter.set_serving::<RateLimitServiceServer<RatelimitService>>().await;
            }
        });
    }

    let authz_addr = config.listen.authz.parse::<std::net::SocketAddr>().map_err(|e| {
        rls::error::FatalError::Bind {
            listener: "authz",
            addr: config.listen.authz.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        }
    })?;
    let ratelimit_addr = config.listen.ratelimit.parse::<std::net::SocketAddr>().map_err(|e| {
        rls::error::FatalError::Bind {
            listener: "ratelimit",
            addr: config.listen.ratelimit.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        }
    })?;

    let authz_service = AuthorizationServer::new(AuthzService::new(state.clone()));
    let ratelimit_service = RateLimitServiceServer::new(RatelimitService::new(state.clone()));

    let authz_server = {
        let mut drain = authz_drain;
        let health_service = health_service.clone();
        tokio::spawn(async move {
            tracing::info!(addr = %authz_addr, "authz server listening");
            let serve = Server::builder()
                .add_service(health_service)
                .add_service(authz_service)
                .serve(authz_addr);
            tokio::select! {
                res = serve => res,
                _ = drain.signaled() => Ok(()),
            }
        })
    };

    let ratelimit_server = {
        let mut drain = ratelimit_drain;
        tokio::spawn(async move {
            tracing::info!(addr = %ratelimit_addr, "ratelimit server listening");
            let serve = Server::builder()
                .add_service(health_service)
                .add_service(ratelimit_service)
                .serve(ratelimit_addr);
            tokio::select! {
                res = serve => res,
                _ = drain.signaled() => Ok(()),
            }
        })
    };

    rls_core::signal::wait_for_signal(shutdown_trigger).await;
    tracing::info!("shutdown signal received, draining");

    let _ = tokio::join!(authz_server, ratelimit_server);
    Ok(())
}
