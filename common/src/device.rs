use std::{os::unix::fs::FileTypeExt, path::PathBuf};

use async_trait::async_trait;
use tokio::fs::{metadata, read_to_string, write};
use tracing::{debug, warn};

use crate::{
    config::EnvironmentSetting,
    error::BenchError,
    util::{device_name, simple_command_with_output},
};

const SYS_BLOCK: &str = "/sys/block";
const DROP_CACHES: &str = "/proc/sys/vm/drop_caches";

/// Runtime knobs of a block device. The orchestrator only goes through this
/// trait, so tests can swap in an in-memory device.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    async fn check_device(&self, device: &str) -> Result<(), BenchError>;
    async fn available_schedulers(&self, device: &str) -> Result<Vec<String>, BenchError>;
    async fn scheduler(&self, device: &str) -> Result<String, BenchError>;
    async fn set_scheduler(&self, device: &str, scheduler: &str) -> Result<(), BenchError>;
    async fn nomerges(&self, device: &str) -> Result<u8, BenchError>;
    async fn set_nomerges(&self, device: &str, value: u8) -> Result<(), BenchError>;
    async fn clear_caches(&self, device: &str) -> Result<(), BenchError>;
}

#[derive(Debug, Clone)]
pub struct SysfsBackend {
    root: PathBuf,
}

impl Default for SysfsBackend {
    fn default() -> Self {
        Self::new(SYS_BLOCK)
    }
}

impl SysfsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn queue_file(&self, device: &str, name: &str) -> PathBuf {
        self.root.join(device_name(device)).join("queue").join(name)
    }

    async fn read_queue(&self, device: &str, name: &str) -> Result<String, BenchError> {
        let path = self.queue_file(device, name);
        read_to_string(&path)
            .await
            .map(|x| x.trim().to_owned())
            .map_err(|err| BenchError::device(device, format!("reading {}: {err}", path.display())))
    }

    async fn write_queue(&self, device: &str, name: &str, value: &str) -> Result<(), BenchError> {
        let path = self.queue_file(device, name);
        write(&path, value)
            .await
            .map_err(|err| BenchError::device(device, format!("writing {}: {err}", path.display())))
    }
}

/// `mq-deadline [none] bfq` -> (`none`, [`mq-deadline`, `none`, `bfq`]).
fn parse_scheduler_line(line: &str) -> (String, Vec<String>) {
    let available = line
        .split_whitespace()
        .map(|x| x.trim_matches(|c| c == '[' || c == ']').to_owned())
        .collect::<Vec<_>>();
    let current = line
        .split_whitespace()
        .find_map(|x| x.strip_prefix('[').and_then(|x| x.strip_suffix(']')))
        .map(|x| x.to_owned())
        .unwrap_or_else(|| line.trim().to_owned());
    (current, available)
}

#[async_trait]
impl DeviceBackend for SysfsBackend {
    async fn check_device(&self, device: &str) -> Result<(), BenchError> {
        let meta = metadata(device)
            .await
            .map_err(|err| BenchError::device(device, err))?;
        if !meta.file_type().is_block_device() {
            return Err(BenchError::device(device, "not a block device"));
        }
        if !self.queue_file(device, "scheduler").exists() {
            return Err(BenchError::device(device, "no scheduler queue in sysfs"));
        }
        Ok(())
    }

    async fn available_schedulers(&self, device: &str) -> Result<Vec<String>, BenchError> {
        Ok(parse_scheduler_line(&self.read_queue(device, "scheduler").await?).1)
    }

    async fn scheduler(&self, device: &str) -> Result<String, BenchError> {
        Ok(parse_scheduler_line(&self.read_queue(device, "scheduler").await?).0)
    }

    async fn set_scheduler(&self, device: &str, scheduler: &str) -> Result<(), BenchError> {
        self.write_queue(device, "scheduler", scheduler).await?;
        let current = self.scheduler(device).await?;
        if current != scheduler {
            return Err(BenchError::device(
                device,
                format!("scheduler is {current} after setting {scheduler}"),
            ));
        }
        debug!("Scheduler of {device} set to {scheduler}");
        Ok(())
    }

    async fn nomerges(&self, device: &str) -> Result<u8, BenchError> {
        let value = self.read_queue(device, "nomerges").await?;
        value
            .parse()
            .map_err(|_| BenchError::device(device, format!("unexpected nomerges value {value}")))
    }

    async fn set_nomerges(&self, device: &str, value: u8) -> Result<(), BenchError> {
        self.write_queue(device, "nomerges", &value.to_string()).await?;
        debug!("nomerges of {device} set to {value}");
        Ok(())
    }

    async fn clear_caches(&self, device: &str) -> Result<(), BenchError> {
        simple_command_with_output("sync", &[]).await?;
        write(DROP_CACHES, "3")
            .await
            .map_err(|err| BenchError::io(DROP_CACHES, err))?;
        simple_command_with_output("blockdev", &["--flushbufs", device]).await?;
        simple_command_with_output("hdparm", &["-F", device]).await?;
        Ok(())
    }
}

/// What a device looked like before it was touched. `nomerges` is only
/// captured when the environment section is going to change it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub scheduler: String,
    pub nomerges: Option<u8>,
}

impl DeviceState {
    pub async fn capture(
        backend: &dyn DeviceBackend,
        device: &str,
        with_nomerges: bool,
    ) -> Result<Self, BenchError> {
        let scheduler = backend.scheduler(device).await?;
        let nomerges = match with_nomerges {
            true => Some(backend.nomerges(device).await?),
            false => None,
        };
        Ok(Self {
            scheduler,
            nomerges,
        })
    }

    /// Writes every setting even when an earlier one fails, then reports the
    /// first failure.
    pub async fn apply(&self, backend: &dyn DeviceBackend, device: &str) -> Result<(), BenchError> {
        let scheduler = backend.set_scheduler(device, &self.scheduler).await;
        let nomerges = match self.nomerges {
            Some(nomerges) => backend.set_nomerges(device, nomerges).await,
            None => Ok(()),
        };
        scheduler.and(nomerges)
    }
}

/// Exclusive hold on a device for one run. The original state is restored by
/// [`DeviceLease::release`], which the caller invokes on every exit path.
pub struct DeviceLease<'a> {
    backend: &'a dyn DeviceBackend,
    device: String,
    original: DeviceState,
}

impl<'a> DeviceLease<'a> {
    pub async fn acquire(
        backend: &'a dyn DeviceBackend,
        device: &str,
        scheduler: &str,
        env: EnvironmentSetting,
    ) -> Result<Self, BenchError> {
        let original = DeviceState::capture(backend, device, env.nomerges.is_some()).await?;
        let lease = Self {
            backend,
            device: device.to_owned(),
            original,
        };
        let wanted = DeviceState {
            scheduler: scheduler.to_owned(),
            nomerges: env.nomerges,
        };
        if let Err(err) = wanted.apply(backend, device).await {
            if let Err(restore_err) = lease.release().await {
                warn!("Could not restore {device}: {restore_err}");
            }
            return Err(err);
        }
        Ok(lease)
    }

    pub fn original(&self) -> &DeviceState {
        &self.original
    }

    pub async fn release(self) -> Result<(), BenchError> {
        self.original.apply(self.backend, &self.device).await?;
        debug!("Restored {} to {:?}", self.device, self.original);
        Ok(())
    }
}

/// Fails unless every device exists and offers every scheduler.
pub async fn check_devices(
    backend: &dyn DeviceBackend,
    devices: &[String],
    schedulers: &[String],
) -> Result<(), BenchError> {
    for device in devices {
        backend.check_device(device).await?;
        let available = backend.available_schedulers(device).await?;
        for scheduler in schedulers {
            if !available.contains(scheduler) {
                return Err(BenchError::config(format!(
                    "scheduler {scheduler} is not available on {device} (available: {})",
                    available.join(" ")
                )));
            }
        }
    }
    Ok(())
}
