//! CSI plugin entry point: parses `config::Args`, connects to the
//! appliance, and serves whichever of the controller/node gRPC services
//! were requested on their own UNIX sockets.

use std::path::Path;

use clap::Parser;
use tonic::transport::Server;
use tracing::{error, info};

use csi_driver::appliance::{Client, ClientConfig};
use csi_driver::config::Args;
use csi_driver::csi;
use csi_driver::{ControllerService, IdentityService, NodeService};

fn uds_incoming(path: &str) -> Result<tokio_stream::wrappers::UnixListenerStream, Box<dyn std::error::Error>> {
    if Path::new(path).exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(path)?;
    Ok(tokio_stream::wrappers::UnixListenerStream::new(listener))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_max_level(args.tracing_level()).init();

    let node_id = args.resolved_node_id()?;

    if args.controller_endpoint.is_none() && args.node_endpoint.is_none() {
        error!("neither --controller-endpoint nor --node-endpoint was set; nothing to serve");
        return Err("no endpoints configured".into());
    }

    if let Ok(metrics_addr) = args.metrics_addr.parse() {
        if let Err(e) = csi_driver::metrics::init_metrics(metrics_addr) {
            error!(error = %e, "failed to start metrics exporter, continuing without it");
        }
    } else {
        error!(addr = %args.metrics_addr, "invalid --metrics-addr, metrics disabled");
    }

    info!(
        driver_name = %args.driver_name,
        node_id = %node_id,
        controller_endpoint = ?args.controller_endpoint,
        node_endpoint = ?args.node_endpoint,
        "starting csi-driver"
    );

    let appliance = Client::connect(ClientConfig {
        url: args.appliance_url.parse()?,
        api_key: args.appliance_api_key.clone(),
        accept_invalid_certs: args.appliance_insecure_tls,
    })
    .await?;

    let mut controller_server = None;
    if let Some(endpoint) = &args.controller_endpoint {
        let controller = ControllerService::new(appliance.clone());
        let incoming = uds_incoming(endpoint)?;
        let identity = IdentityService::with_appliance(args.driver_name.clone(), appliance.clone());
        controller_server = Some(tokio::spawn(
            Server::builder()
                .add_service(csi::identity_server::IdentityServer::new(identity))
                .add_service(csi::controller_server::ControllerServer::new(controller))
                .serve_with_incoming(incoming),
        ));
        info!(endpoint, "controller service listening");
    }

    let mut node_server = None;
    if let Some(endpoint) = &args.node_endpoint {
        let node = NodeService::new(node_id.clone(), args.attach_concurrency);
        let incoming = uds_incoming(endpoint)?;
        let identity = IdentityService::with_appliance(args.driver_name.clone(), appliance.clone());
        node_server = Some(tokio::spawn(
            Server::builder()
                .add_service(csi::identity_server::IdentityServer::new(identity))
                .add_service(csi::node_server::NodeServer::new(node))
                .serve_with_incoming(incoming),
        ));
        info!(endpoint, "node service listening");
    }

    if let Some(handle) = controller_server {
        handle.await??;
    }
    if let Some(handle) = node_server {
        handle.await??;
    }

    Ok(())
}
