#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use chirp_common::id::random_hex;
use chirp_gateway::auth_client::AuthClient;
use chirp_gateway::dispatcher::{GatewayDispatcher, spawn_kick_listener};
use chirp_gateway::redis_session::RedisSessionManager;
use chirp_net::{TcpServer, WebSocketServer};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chirp_gateway [options]\n\
\n\
Options:\n\
\t--port, -p     TCP listen port (default: 5000)\n\
\t--ws_port      WebSocket listen port (default: tcp port + 1)\n\
\t--auth_host    Auth service host (unset: scaffolding mode)\n\
\t--auth_port    Auth service port (default: 6000)\n\
\t--redis_host   Redis host (unset: single-instance mode)\n\
\t--redis_port   Redis port (default: 6379)\n\
\t--redis_ttl    Session lease TTL seconds (default: 3600)\n\
\t--instance_id  Identity for the Redis lease (default: random hex)\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Clone)]
struct GatewayArgs {
	port: u16,
	ws_port: u16,
	auth_host: Option<String>,
	auth_port: u16,
	redis_host: Option<String>,
	redis_port: u16,
	redis_ttl: i64,
	instance_id: String,
}

fn parse_args() -> GatewayArgs {
	let mut port: u16 = 5000;
	let mut ws_port: Option<u16> = None;
	let mut auth_host: Option<String> = None;
	let mut auth_port: u16 = 6000;
	let mut redis_host: Option<String> = None;
	let mut redis_port: u16 = 6379;
	let mut redis_ttl: i64 = 3600;
	let mut instance_id = String::new();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = |name: &str| it.next().unwrap_or_else(|| {
			eprintln!("{name} requires a value");
			usage_and_exit()
		});
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--port" | "-p" => port = parse_u16(&value("--port")),
			"--ws_port" => ws_port = Some(parse_u16(&value("--ws_port"))),
			"--auth_host" => auth_host = Some(value("--auth_host")),
			"--auth_port" => auth_port = parse_u16(&value("--auth_port")),
			"--redis_host" => redis_host = Some(value("--redis_host")),
			"--redis_port" => redis_port = parse_u16(&value("--redis_port")),
			"--redis_ttl" => {
				redis_ttl = value("--redis_ttl").parse().unwrap_or_else(|_| {
					eprintln!("--redis_ttl must be an integer");
					usage_and_exit()
				})
			}
			"--instance_id" => instance_id = value("--instance_id"),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit()
			}
		}
	}

	if instance_id.is_empty() {
		instance_id = random_hex(8);
	}

	GatewayArgs {
		port,
		ws_port: ws_port.unwrap_or(port + 1),
		auth_host,
		auth_port,
		redis_host,
		redis_port,
		redis_ttl,
		instance_id,
	}
}

fn parse_u16(s: &str) -> u16 {
	s.parse().unwrap_or_else(|_| {
		eprintln!("invalid port: {s}");
		usage_and_exit()
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chirp_gateway=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

fn init_metrics() {
	let Ok(bind) = std::env::var("CHIRP_METRICS_BIND") else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();
	init_metrics();

	info!(
		tcp = args.port,
		ws = args.ws_port,
		auth = args.auth_host.as_deref().unwrap_or("(scaffolding)"),
		redis = args.redis_host.as_deref().unwrap_or("(single-instance)"),
		instance = %args.instance_id,
		"chirp_gateway starting"
	);

	let auth = args
		.auth_host
		.as_deref()
		.map(|host| AuthClient::new(host, args.auth_port));

	let (kick_tx, kick_rx) = mpsc::unbounded_channel();
	let redis = args.redis_host.as_deref().map(|host| {
		Arc::new(RedisSessionManager::start(
			host,
			args.redis_port,
			args.instance_id.clone(),
			args.redis_ttl,
			kick_tx,
		))
	});

	let dispatcher = Arc::new(GatewayDispatcher::new(auth, redis));
	spawn_kick_listener(Arc::clone(&dispatcher), kick_rx);

	let tcp_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
	let ws_addr: SocketAddr = ([0, 0, 0, 0], args.ws_port).into();
	let tcp_server = TcpServer::bind(tcp_addr, dispatcher.clone()).await?;
	let ws_server = WebSocketServer::bind(ws_addr, dispatcher).await?;
	info!(tcp = %tcp_server.local_addr(), ws = %ws_server.local_addr(), "listening");

	wait_for_shutdown().await;
	info!("shutdown requested");
	tcp_server.shutdown();
	ws_server.shutdown();
	info!("chirp_gateway exited");
	Ok(())
}

async fn wait_for_shutdown() {
	let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
		Ok(s) => s,
		Err(e) => {
			warn!(error = %e, "failed to install SIGTERM handler");
			let _ = tokio::signal::ctrl_c().await;
			return;
		}
	};

	tokio::select! {
		_ = tokio::signal::ctrl_c() => {}
		_ = sigterm.recv() => {}
	}
}
