use crate::error::{CommError, Result};

/// Opaque device-runtime capability consumed by communicator setup. The real
/// accelerator runtime is an external collaborator; initialization only needs
/// a liveness probe, identity attributes, and a way to drain in-flight device
/// work before teardown.
pub trait DeviceRuntime: Send + Sync {
    fn device_count(&self) -> i32;

    /// Cheap liveness probe. Called before any other allocation so that a
    /// broken device surfaces immediately as `UnhandledDeviceError`.
    fn touch(&self, device: i32) -> Result<()>;

    /// Compute capability, encoded as major * 10 + minor.
    fn comp_cap(&self, device: i32) -> u32;

    /// PCI bus id of the device, unique per (host, device).
    fn bus_id(&self, device: i32) -> u64;

    /// Device number of the shared-memory mount, used to decide whether
    /// shared-memory transports can cross process boundaries in containers.
    fn shm_dev(&self) -> u64;

    /// Whether the device supports GPU-direct RDMA.
    fn gdr_support(&self, device: i32) -> bool;

    /// Whether the driver supports multi-device cooperative launch.
    fn cooperative_launch_support(&self, device: i32) -> bool;

    /// Blocks until all device work enqueued by this communicator completed.
    fn stream_synchronize(&self, device: i32) -> Result<()>;
}

/// Host-only stand-in used by default and in tests: devices are plain
/// indices with deterministic identity attributes and no outstanding work.
pub struct HostRuntime {
    num_devices: i32,
}

impl HostRuntime {
    pub fn new(num_devices: i32) -> Self {
        HostRuntime { num_devices }
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        HostRuntime::new(16)
    }
}

impl DeviceRuntime for HostRuntime {
    fn device_count(&self) -> i32 {
        self.num_devices
    }

    fn touch(&self, device: i32) -> Result<()> {
        if device < 0 || device >= self.num_devices {
            return Err(CommError::UnhandledDeviceError(format!(
                "device {} does not exist",
                device
            )));
        }
        Ok(())
    }

    fn comp_cap(&self, _device: i32) -> u32 {
        80
    }

    fn bus_id(&self, device: i32) -> u64 {
        // synthetic, but unique per index like a real bus id is per slot
        0x1000 + device as u64
    }

    fn shm_dev(&self) -> u64 {
        0
    }

    fn gdr_support(&self, _device: i32) -> bool {
        false
    }

    fn cooperative_launch_support(&self, _device: i32) -> bool {
        true
    }

    fn stream_synchronize(&self, _device: i32) -> Result<()> {
        Ok(())
    }
}
