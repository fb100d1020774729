//! volkeepctl - CLI client for a CSI controller.
//!
//! Usage:
//!   volkeepctl probe
//!   volkeepctl info
//!   volkeepctl capabilities
//!   volkeepctl create <name> [--size <bytes>] [--mode <MODE>]... [--block]
//!   volkeepctl delete <volume-id>
//!   volkeepctl validate <volume-id> [--mode <MODE>]... [--block]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use tonic::transport::Channel;

use volkeep_csi::config::DEFAULT_ENDPOINT;
use volkeep_csi::csi;
use volkeep_csi::csi::controller_client::ControllerClient;
use volkeep_csi::csi::identity_client::IdentityClient;
use volkeep_csi::csi::volume_capability::access_mode::Mode;
use volkeep_csi::csi::volume_capability::{AccessMode, AccessType, BlockVolume, MountVolume};
use volkeep_dial::{DialOption, choose_dial_opts, connect};

#[derive(Parser)]
#[command(name = "volkeepctl")]
#[command(about = "Talk to a CSI controller")]
struct Cli {
    /// CSI endpoint (unix://, tcp:// or host:port)
    #[arg(short, long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the plugin is ready
    Probe,
    /// Show plugin name and version
    Info,
    /// List controller capabilities
    Capabilities,
    /// Create a volume
    Create {
        /// Volume name
        name: String,
        /// Minimum size in bytes (0 lets the plugin choose)
        #[arg(long, default_value = "0")]
        size: i64,
        #[command(flatten)]
        caps: CapabilityArgs,
    },
    /// Delete a volume
    Delete {
        /// Volume ID
        volume_id: String,
    },
    /// Ask whether a volume supports the given capabilities
    Validate {
        /// Volume ID
        volume_id: String,
        #[command(flatten)]
        caps: CapabilityArgs,
    },
}

#[derive(clap::Args)]
struct CapabilityArgs {
    /// Access mode by CSI name, e.g. SINGLE_NODE_WRITER (repeatable)
    #[arg(long = "mode", default_value = "SINGLE_NODE_WRITER")]
    modes: Vec<String>,

    /// Request raw block access instead of a filesystem mount
    #[arg(long)]
    block: bool,

    /// Filesystem type for mount access
    #[arg(long, default_value = "ext4")]
    fs_type: String,
}

impl CapabilityArgs {
    fn to_capabilities(&self) -> Result<Vec<csi::VolumeCapability>> {
        self.modes
            .iter()
            .map(|name| {
                let mode = Mode::from_str_name(name)
                    .ok_or_else(|| anyhow!("unknown access mode: {name}"))?;
                let access_type = if self.block {
                    AccessType::Block(BlockVolume {})
                } else {
                    AccessType::Mount(MountVolume {
                        fs_type: self.fs_type.clone(),
                        mount_flags: vec![],
                    })
                };
                Ok(csi::VolumeCapability {
                    access_type: Some(access_type),
                    access_mode: Some(AccessMode { mode: mode as i32 }),
                })
            })
            .collect()
    }
}

fn format_size(bytes: i64) -> String {
    const GIB: i64 = 1 << 30;
    const MIB: i64 = 1 << 20;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

async fn open_channel(endpoint: &str, timeout: Duration) -> Result<Channel> {
    let opts = choose_dial_opts(
        endpoint,
        [
            DialOption::Insecure,
            DialOption::ConnectTimeout(timeout),
            DialOption::Timeout(timeout),
        ],
    );
    connect(endpoint, opts)
        .await
        .with_context(|| format!("Failed to connect to controller at {endpoint}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let channel = open_channel(&cli.endpoint, Duration::from_secs(cli.timeout)).await?;

    match cli.command {
        Commands::Probe => {
            let response = IdentityClient::new(channel)
                .probe(csi::ProbeRequest {})
                .await?
                .into_inner();
            match response.ready {
                Some(false) => {
                    println!("not ready");
                    std::process::exit(1);
                }
                _ => println!("ready"),
            }
        }
        Commands::Info => {
            let info = IdentityClient::new(channel)
                .get_plugin_info(csi::GetPluginInfoRequest {})
                .await?
                .into_inner();
            println!("Name:    {}", info.name);
            println!("Version: {}", info.vendor_version);
        }
        Commands::Capabilities => {
            let response = ControllerClient::new(channel)
                .controller_get_capabilities(csi::ControllerGetCapabilitiesRequest {})
                .await?
                .into_inner();
            for cap in response.capabilities {
                if let Some(csi::controller_service_capability::Type::Rpc(rpc)) = cap.r#type {
                    println!("{}", rpc.r#type().as_str_name());
                }
            }
        }
        Commands::Create { name, size, caps } => {
            let request = csi::CreateVolumeRequest {
                name,
                capacity_range: (size > 0).then_some(csi::CapacityRange {
                    required_bytes: size,
                    limit_bytes: 0,
                }),
                volume_capabilities: caps.to_capabilities()?,
                parameters: HashMap::new(),
                secrets: HashMap::new(),
                volume_content_source: None,
                accessibility_requirements: None,
            };
            let volume = ControllerClient::new(channel)
                .create_volume(request)
                .await?
                .into_inner()
                .volume
                .context("controller returned no volume")?;
            println!("Volume: {}", volume.volume_id);
            println!("  Size: {}", format_size(volume.capacity_bytes));
        }
        Commands::Delete { volume_id } => {
            ControllerClient::new(channel)
                .delete_volume(csi::DeleteVolumeRequest {
                    volume_id,
                    secrets: HashMap::new(),
                })
                .await?;
            println!("OK");
        }
        Commands::Validate { volume_id, caps } => {
            let response = ControllerClient::new(channel)
                .validate_volume_capabilities(csi::ValidateVolumeCapabilitiesRequest {
                    volume_id,
                    volume_context: HashMap::new(),
                    volume_capabilities: caps.to_capabilities()?,
                    parameters: HashMap::new(),
                    secrets: HashMap::new(),
                })
                .await?
                .into_inner();
            match response.confirmed {
                Some(confirmed) => {
                    println!("Confirmed {} capabilities", confirmed.volume_capabilities.len());
                }
                None => {
                    eprintln!("Not confirmed: {}", response.message);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
