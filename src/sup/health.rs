use crate::sup::record::ProcessRecord;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Answers "which of these pids are alive" for a whole batch at once.
pub trait LivenessProbe: Send + Sync {
    fn live_pids(&self, pids: &[u32]) -> BTreeSet<u32>;
}

/// Null-signal probe: `ESRCH` means gone, success or `EPERM` means alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    fn live_pids(&self, pids: &[u32]) -> BTreeSet<u32> {
        pids.iter()
            .copied()
            .filter(|pid| {
                let Ok(raw) = i32::try_from(*pid) else {
                    return false;
                };
                // pid 0 and negatives address process groups, never a child.
                raw > 0 && matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
            })
            .collect()
    }
}

/// Per-record running flags, aligned with `records` by index. Records that
/// were never started report `false`.
pub fn sweep(records: &[ProcessRecord], probe: &dyn LivenessProbe) -> Vec<bool> {
    let pids: Vec<u32> = records.iter().filter_map(|r| r.pid).collect();
    let live = if pids.is_empty() {
        BTreeSet::new()
    } else {
        probe.live_pids(&pids)
    };
    records
        .iter()
        .map(|r| r.pid.is_some_and(|pid| live.contains(&pid)))
        .collect()
}

/// Indices the keep-alive pass should restart: started before, not
/// running now, and not deliberately stopped.
pub fn crashed(records: &[ProcessRecord], running: &[bool]) -> Vec<usize> {
    records
        .iter()
        .zip(running)
        .enumerate()
        .filter(|(_, (r, running))| r.pid.is_some() && !**running && !r.ignore)
        .map(|(idx, _)| idx)
        .collect()
}

/// Calls `on_tick` every `period`, first after one full period. The task
/// ends when `on_tick` returns false or the handle is aborted.
pub fn spawn_ticker<F>(period: Duration, mut on_tick: F) -> JoinHandle<()>
where
    F: FnMut() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !on_tick() {
                break;
            }
        }
    })
}
