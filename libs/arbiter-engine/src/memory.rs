//! Peak memory sampling for a running child.
//!
//! Memory is polled, so very short spikes may be missed. The figure is
//! reported for information and as a secondary cap signal for runtimes that
//! cannot run under RLIMIT_AS; it is never used to pass a run.

use std::time::Duration;

use sysinfo::{Pid, System};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Tracks peak RSS of a child process while it runs.
pub struct MemoryTracker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<u64>,
}

impl MemoryTracker {
    /// Start sampling `pid` every `sample_every`.
    /// Sampling ends on its own once the process can no longer be inspected.
    pub fn start(pid: u32, sample_every: Duration) -> Self {
        let (stop, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let pid = Pid::from_u32(pid);
            let mut system = System::new();
            let mut peak_bytes = 0u64;
            let mut ticker = tokio::time::interval(sample_every);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if !system.refresh_process(pid) {
                            break;
                        }
                        if let Some(process) = system.process(pid) {
                            peak_bytes = peak_bytes.max(process.memory());
                        }
                    }
                }
            }

            peak_bytes
        });

        Self { stop, handle }
    }

    /// Stop sampling and return the peak in KB, if anything was observed
    pub async fn finish(self) -> Option<u64> {
        let _ = self.stop.send(());
        match self.handle.await {
            Ok(peak_bytes) if peak_bytes > 0 => Some(peak_bytes / 1024),
            _ => None,
        }
    }
}
