//! CLI & configuration (component F, ambient stack). Grounded on
//! `csi-driver/src/main.rs`'s `Args` and `ctld-agent/src/main.rs`'s
//! `clap`-derived flags.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "csi-driver")]
#[command(about = "CSI plugin for a ZFS-based network storage appliance")]
pub struct Args {
    /// Controller gRPC endpoint (unix socket path). Omit to disable the
    /// controller service in this process.
    #[arg(long)]
    pub controller_endpoint: Option<String>,

    /// Node gRPC endpoint (unix socket path). Omit to disable the node
    /// service in this process.
    #[arg(long)]
    pub node_endpoint: Option<String>,

    /// Node ID for this CSI node; falls back to the host's hostname.
    #[arg(long, env = "CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Appliance WebSocket URL, e.g. wss://appliance.example.com/websocket
    #[arg(long, env = "APPLIANCE_URL")]
    pub appliance_url: String,

    /// Appliance API key. Never logged; read from the environment so it
    /// never appears in a process listing.
    #[arg(long, env = "APPLIANCE_API_KEY")]
    pub appliance_api_key: String,

    /// Accept the appliance's TLS certificate without verification.
    #[arg(long, default_value = "false")]
    pub appliance_insecure_tls: bool,

    /// Driver name advertised via GetPluginInfo.
    #[arg(long, default_value = "appliance.csi.example.com")]
    pub driver_name: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Maximum concurrent NVMe-oF attach operations (the attach
    /// semaphore, spec.md §4.4.1 step 4 / §5).
    #[arg(long, default_value = "4")]
    pub attach_concurrency: usize,

    /// Prometheus metrics HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:9100")]
    pub metrics_addr: String,
}

impl Args {
    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }

    pub fn resolved_node_id(&self) -> Result<String, std::io::Error> {
        match &self.node_id {
            Some(id) => Ok(id.clone()),
            None => Ok(hostname::get()?.to_string_lossy().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_with_only_required_flags() {
        let args = Args::parse_from([
            "csi-driver",
            "--appliance-url",
            "wss://appliance.example.com/websocket",
            "--appliance-api-key",
            "secret",
        ]);
        assert_eq!(args.attach_concurrency, 4);
        assert_eq!(args.driver_name, "appliance.csi.example.com");
        assert!(args.controller_endpoint.is_none());
        assert!(args.node_endpoint.is_none());
    }

    #[test]
    fn tracing_level_defaults_to_info() {
        let args = Args::parse_from([
            "csi-driver",
            "--appliance-url",
            "wss://appliance.example.com/websocket",
            "--appliance-api-key",
            "secret",
        ]);
        assert_eq!(args.tracing_level(), tracing::Level::INFO);
    }
}
