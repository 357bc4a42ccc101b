#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use chirp_chat::dispatcher::ChatDispatcher;
use chirp_net::TcpServer;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: chirp_chat [--port PORT]\n\
\n\
Options:\n\
\t--port, -p   TCP listen port (default: 7000)\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> u16 {
	let mut port: u16 = 7000;

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
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit()
			}
		}
	}

	port
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chirp_chat=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(filter))
		.with_target(false)
		.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let port = parse_args();
	info!(port, "chirp_chat starting");

	let dispatcher = Arc::new(ChatDispatcher::new());
	let addr: SocketAddr = ([0, 0, 0, 0], port).into();
	let server = TcpServer::bind(addr, dispatcher).await?;
	info!(addr = %server.local_addr(), "listening");

	wait_for_shutdown().await;
	info!("shutdown requested");
	server.shutdown();
	info!("chirp_chat exited");
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
