#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use chirp_auth::dispatcher::AuthDispatcher;
use chirp_net::TcpServer;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chirp_auth [options]\n\
\n\
Options:\n\
\t--port, -p     TCP listen port (default: 6000)\n\
\t--jwt_secret   HS256 secret for JWT-shaped tokens (default: dev_secret)\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> (u16, String) {
	let mut port: u16 = 6000;
	let mut jwt_secret = "dev_secret".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--port" | "-p" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				port = v.parse().unwrap_or_else(|_| {
					eprintln!("invalid port: {v}");
					usage_and_exit()
				});
			}
			"--jwt_secret" => {
				jwt_secret = it.next().unwrap_or_else(|| usage_and_exit());
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit()
			}
		}
	}

	(port, jwt_secret)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chirp_auth=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let (port, jwt_secret) = parse_args();
	info!(port, "chirp_auth starting");

	let dispatcher = Arc::new(AuthDispatcher::new(jwt_secret));
	let addr: SocketAddr = ([0, 0, 0, 0], port).into();
	let server = TcpServer::bind(addr, dispatcher).await?;
	info!(addr = %server.local_addr(), "listening");

	wait_for_shutdown().await;
	info!("shutdown requested");
	server.shutdown();
	info!("chirp_auth exited");
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
