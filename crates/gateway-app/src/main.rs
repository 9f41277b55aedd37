//! Binary entry point: loads configuration, wires up the authorization
//! pipeline, and serves it behind two listeners — the main proxy port and a
//! loopback-only admin port — exactly as the teacher's `agentgateway-app`
//! binary and `management/admin.rs` split the two concerns.

mod admin;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use sidecar_core::signal::{new_shutdown, shutdown_on_signal};
use sidecar_core::{telemetry, version};
use sidecar_gateway::config::{ConfigModel, PolicyMode};
use sidecar_gateway::jwt::{TenantProfile, TokenValidator};
use sidecar_gateway::pipeline::{self, Pipeline};
use sidecar_gateway::policy::{PolicyEngine, PolicyLoader};
use sidecar_gateway::roles::RolesEnricher;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sidecar-gateway", version)]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(long, env = "SIDECAR_CONFIG", default_value = "config.yaml")]
	config: std::path::PathBuf,

	/// Address the main proxy listener binds to.
	#[arg(long, env = "SIDECAR_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
	listen_addr: SocketAddr,

	/// Address the admin listener binds to; should stay loopback-only in
	/// production, same as the teacher's default.
	#[arg(long, env = "SIDECAR_ADMIN_ADDR", default_value = "127.0.0.1:15021")]
	admin_addr: SocketAddr,

	/// Default tracing-subscriber filter directive.
	#[arg(long, env = "SIDECAR_LOG_LEVEL", default_value = "info")]
	log_level: String,

	/// Emit structured JSON logs instead of the human-readable format.
	#[arg(long, env = "SIDECAR_JSON_LOGS")]
	json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	telemetry::init(&args.log_level, args.json_logs);

	let build = version::BuildInfo::current();
	info!(version = build.version, git_commit = build.git_commit, "starting sidecar gateway");

	let raw = tokio::fs::read_to_string(&args.config).await.map_err(|e| anyhow::anyhow!("reading config file {:?}: {e}", args.config))?;
	let config = ConfigModel::from_yaml(&raw)?;

	let http = reqwest::Client::builder().build()?;

	let token_validator = build_token_validator(&config, http.clone()).await?;
	let roles = RolesEnricher::new(&config.roles, http.clone());

	let policy_engine = if config.policy.enabled {
		Some(build_policy_engine(&config, http.clone()).await?)
	} else {
		None
	};

	let shutdown_grace = config.shutdown_grace;
	let pipeline = Arc::new(Pipeline::new(config.clone(), token_validator, roles, policy_engine));
	let drain = pipeline.drain_watcher();

	let (shutdown_trigger, mut shutdown_watcher) = new_shutdown();
	shutdown_on_signal(shutdown_trigger.clone());

	let ready = admin::ready_flag();
	let admin_app = admin::router(shutdown_trigger.clone(), config.clone(), ready.clone());
	let admin_listener = tokio::net::TcpListener::bind(args.admin_addr).await?;
	info!(addr = %args.admin_addr, "admin listener bound");
	let mut admin_shutdown_watcher = shutdown_watcher.clone();
	let admin_task = tokio::spawn(async move {
		axum::serve(admin_listener, admin_app)
			.with_graceful_shutdown(async move { admin_shutdown_watcher.signaled().await })
			.await
	});

	let app = axum::Router::new().fallback(pipeline::handler).with_state(pipeline);
	let main_listener = tokio::net::TcpListener::bind(args.listen_addr).await?;
	info!(addr = %args.listen_addr, "proxy listener bound");
	ready.store(true, std::sync::atomic::Ordering::Release);
	axum::serve(main_listener, app.into_make_service_with_connect_info::<SocketAddr>())
		.with_graceful_shutdown(async move { shutdown_watcher.signaled().await })
		.await?;
	ready.store(false, std::sync::atomic::Ordering::Release);

	// The listener has stopped accepting new connections; drain whatever
	// requests were already in flight (up to the configured grace window)
	// before tearing down the HTTP client, policy watcher, and caches that
	// those requests still depend on.
	info!(?shutdown_grace, "draining in-flight requests");
	drain.drain(shutdown_grace).await;

	if let Err(e) = admin_task.await {
		warn!(error = %e, "admin listener task panicked");
	}

	info!("shutdown complete");
	Ok(())
}

async fn build_token_validator(config: &ConfigModel, http: reqwest::Client) -> anyhow::Result<Option<TokenValidator>> {
	if config.auth.tenants.is_empty() {
		warn!("no tenant profiles configured; all requests will be treated as anonymous");
		return Ok(None);
	}

	let mut profiles = std::collections::HashMap::new();
	for (name, cfg) in &config.auth.tenants {
		let profile = Arc::new(TenantProfile::load(cfg, http.clone()).await.map_err(|e| anyhow::anyhow!("loading tenant profile {name:?}: {e}"))?);
		profile.spawn_refresher();
		profiles.insert(name.clone(), profile);
	}
	Ok(Some(TokenValidator::new(profiles)))
}

async fn build_policy_engine(config: &ConfigModel, http: reqwest::Client) -> anyhow::Result<PolicyEngine> {
	match config.policy.mode {
		PolicyMode::Embedded => {
			let loader = Arc::new(
				PolicyLoader::discover(config.policy.policy_dir.as_deref(), config.policy.dev_policy_dir.as_deref(), &config.policy.entrypoint).await?,
			);
			loader.watch(config.reload_debounce)?;
			Ok(PolicyEngine::embedded(&loader, &config.policy))
		},
		PolicyMode::External => Ok(PolicyEngine::external(http, &config.policy)),
	}
}
