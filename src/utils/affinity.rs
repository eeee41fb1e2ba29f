use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;

/// Pins the calling thread to a CPU set and restores the previous affinity on
/// drop, so the process-wide mask cannot leak on any exit path.
///
/// Used around channel materialization and connection setup so host
/// allocations land NUMA-local to the owned device.
pub struct AffinityGuard {
    saved: CpuSet,
}

impl AffinityGuard {
    pub fn pin(cpus: &[usize]) -> Option<AffinityGuard> {
        if cpus.is_empty() {
            return None;
        }
        let saved = match sched_getaffinity(Pid::from_raw(0)) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("Failed to read CPU affinity: {}, not pinning", e);
                return None;
            }
        };
        let mut target = CpuSet::new();
        for &cpu in cpus {
            if target.set(cpu).is_err() {
                log::warn!("CPU index {} out of range for affinity mask", cpu);
            }
        }
        match sched_setaffinity(Pid::from_raw(0), &target) {
            Ok(()) => Some(AffinityGuard { saved }),
            Err(e) => {
                log::warn!("Failed to set CPU affinity: {}, not pinning", e);
                None
            }
        }
    }
}

impl Drop for AffinityGuard {
    fn drop(&mut self) {
        if let Err(e) = sched_setaffinity(Pid::from_raw(0), &self.saved) {
            log::warn!("Failed to restore CPU affinity: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_restores_on_drop() {
        let before = sched_getaffinity(Pid::from_raw(0)).unwrap();
        {
            let _guard = AffinityGuard::pin(&[0]);
        }
        let after = sched_getaffinity(Pid::from_raw(0)).unwrap();
        assert_eq!(format!("{:?}", before), format!("{:?}", after));
    }
}
