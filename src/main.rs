use std::env;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use connmap::agent::Agent;
use connmap::config::Args;
use connmap::devices::DEFAULT_MTU;
use connmap::handshake::TRACE_ENV;
use connmap::rpc::Peers;
use connmap::server::{self, Server};
use connmap::{logging, sniff};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var(TRACE_ENV).is_ok_and(|value| value == "true") {
        run_capture_child();
    }

    let args = Args::parse();
    logging::init(&args.log_level);

    let peers = Peers::new();
    let agent = Arc::new(Agent::new(args.agent_config(), args.settings(), peers));
    let registry = server::local_registry(Arc::clone(&agent))?;

    let server = Server::bind(&args.listen, registry, args.heartbeat()).await?;
    info!(url = %server.url()?, "listening");

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "could not listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    agent.stop_all().await;
    info!("stopped");
    Ok(())
}

/// Capture role: `<device> <mtu>`; stdout carries the handshake and frames.
fn run_capture_child() -> ! {
    logging::init("warn");

    let mut args = env::args().skip(1);
    let Some(device) = args.next() else {
        error!("capture child started without a device");
        process::exit(2);
    };
    let mtu = args
        .next()
        .and_then(|mtu| mtu.parse().ok())
        .unwrap_or(DEFAULT_MTU);

    match sniff::serve_capture_child(&device, mtu) {
        Ok(()) => process::exit(0),
        Err(e) => {
            error!(%device, error = %e, "capture child failed");
            process::exit(1)
        }
    }
}
