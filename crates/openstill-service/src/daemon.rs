//! The daemon: discovery, engine bring-up, socket serving, shutdown.

use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use openstill_engine::{HostController, StillDevice};
use rusb::Context;
use tokio::net::UnixListener;
use tracing::{error, info, warn};

use crate::config::ServiceConfig;
use crate::enumerate;
use crate::ipc::DeviceServer;

/// One running device: the engine plus its socket path for cleanup.
struct ServedDevice {
    dev: Arc<StillDevice>,
    socket_path: std::path::PathBuf,
}

pub struct Daemon {
    config: ServiceConfig,
    devices: Vec<ServedDevice>,
}

impl Daemon {
    /// Discover cameras and bring each one up. Devices that fail probe
    /// are skipped with a log line; the daemon runs with the rest.
    pub fn new(config: ServiceConfig) -> Result<Self> {
        let context = Context::new().context("initializing libusb")?;
        let cameras = enumerate::discover(&context)?;

        let mut devices = Vec::new();
        for camera in cameras {
            let description = camera.description.clone();
            let ctl: Arc<dyn HostController> = Arc::new(camera.controller);
            match StillDevice::probe(ctl, description, config.engine_tuning()) {
                Ok(dev) => {
                    let socket_path = config.socket_path(dev.id());
                    devices.push(ServedDevice { dev, socket_path });
                }
                Err(err) => {
                    warn!(
                        vendor = format_args!("{:04x}", camera.description.vendor_id),
                        product = format_args!("{:04x}", camera.description.product_id),
                        error = %err,
                        "device probe failed"
                    );
                }
            }
        }

        if devices.is_empty() {
            warn!("no still-capture cameras found");
        }

        Ok(Self { config, devices })
    }

    /// Serve every device socket until interrupted, then tear down.
    pub async fn run(self) -> Result<()> {
        std::fs::create_dir_all(&self.config.socket_dir).with_context(|| {
            format!("creating socket dir {}", self.config.socket_dir.display())
        })?;

        let mut tasks = Vec::new();
        for served in &self.devices {
            // Stale socket from an unclean shutdown.
            let _ = std::fs::remove_file(&served.socket_path);
            let listener = UnixListener::bind(&served.socket_path).with_context(|| {
                format!("binding {}", served.socket_path.display())
            })?;
            info!(
                device = served.dev.id(),
                socket = %served.socket_path.display(),
                "serving"
            );
            let server = Arc::new(DeviceServer::new(Arc::clone(&served.dev)));
            tasks.push(tokio::spawn(async move {
                if let Err(err) = server.serve(listener).await {
                    error!(error = %err, "device server exited");
                }
            }));
        }

        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("shutting down");

        for task in &tasks {
            task.abort();
        }
        for served in &self.devices {
            served.dev.shutdown();
            let _ = std::fs::remove_file(&served.socket_path);
        }
        Ok(())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
