//! # Statistics reporter
//!
//! Periodic per-ODID throughput report (packets, data records, lost
//! records, per-interval rates), pipeline queue fill levels and, on Linux,
//! the CPU share of each collector thread over the last interval. Output
//! goes to the log stream or, when configured, to a `<path>.<pid>` file
//! that is rewritten every interval; stale `<path>*` files from previous
//! runs are removed at startup.

use crate::input::InputInfo;
use crate::ring_buffer::RingBuffer;

use log::{info, warn};

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Registry of named pipeline queues (preprocessor output and every
/// intermediate output); the configurator refreshes it on every reload.
#[derive(Default)]
pub struct QueueDirectory {
    entries: Mutex<Vec<(String, Arc<RingBuffer>)>>,
}

impl QueueDirectory {
    pub fn new() -> Arc<QueueDirectory> {
        Arc::new(QueueDirectory::default())
    }

    pub fn set(&self, entries: Vec<(String, Arc<RingBuffer>)>) {
        *self.entries.lock().unwrap() = entries;
    }

    pub fn snapshot(&self) -> Vec<(String, usize, usize)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(name, q)| (name.clone(), q.len(), q.capacity()))
            .collect()
    }
}

/// Reporter configuration.
#[derive(Debug, Clone)]
pub struct StatsSettings {
    /// Reporting interval in seconds.
    pub interval: u64,
    /// Statistics file; `None` reports to the log stream.
    pub file: Option<PathBuf>,
}

/// Handle of the running reporter thread.
pub struct StatsReporter {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

type DataManagerDepths = Box<dyn Fn() -> Vec<(u32, usize, usize)> + Send>;

impl StatsReporter {
    pub fn spawn(
        settings: StatsSettings,
        infos: Arc<Mutex<Vec<Arc<InputInfo>>>>,
        queues: Arc<QueueDirectory>,
        dm_depths: DataManagerDepths,
    ) -> StatsReporter {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let stop_clone = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("stats".to_string())
            .spawn(move || reporter_loop(settings, infos, queues, dm_depths, stop_clone))
            .ok();

        StatsReporter { stop, handle }
    }

    pub fn stop(mut self) {
        {
            let (lock, cond) = &*self.stop;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

/// Remove statistics files left behind by previous runs: every file in the
/// parent directory whose name starts with the configured file name.
fn clean_stale_files(path: &PathBuf) {
    let Some(parent) = path.parent() else { return };
    let Some(prefix) = path.file_name().and_then(|n| n.to_str()) else {
        return;
    };
    let Ok(dir) = std::fs::read_dir(parent) else { return };

    let mut removed = 0usize;
    for entry in dir.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(prefix) && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!("cleaned up {removed} old statistics file(s)");
    }
}

#[derive(Default, Clone, Copy)]
struct OdidSnapshot {
    packets: u64,
    data_records: u64,
    lost_records: u64,
}

fn reporter_loop(
    settings: StatsSettings,
    infos: Arc<Mutex<Vec<Arc<InputInfo>>>>,
    queues: Arc<QueueDirectory>,
    dm_depths: DataManagerDepths,
    stop: Arc<(Mutex<bool>, Condvar)>,
) {
    if settings.interval == 0 {
        return;
    }

    let out_path = settings.file.as_ref().map(|path| {
        clean_stale_files(path);
        let mut with_pid = path.clone().into_os_string();
        with_pid.push(format!(".{}", std::process::id()));
        PathBuf::from(with_pid)
    });

    let begin = Instant::now();
    let mut previous: HashMap<u32, OdidSnapshot> = HashMap::new();
    #[cfg(target_os = "linux")]
    let mut cpu = cpu::CpuTracker::default();

    let (lock, cond) = &*stop;
    let mut stopped = lock.lock().unwrap();
    loop {
        let (guard, timeout) = cond
            .wait_timeout(stopped, Duration::from_secs(settings.interval))
            .unwrap();
        stopped = guard;
        if *stopped {
            break;
        }
        if !timeout.timed_out() {
            continue;
        }

        // Aggregate source counters per ODID.
        let mut current: HashMap<u32, OdidSnapshot> = HashMap::new();
        for info in infos.lock().unwrap().iter() {
            use std::sync::atomic::Ordering::Relaxed;
            let entry = current.entry(info.current_odid()).or_default();
            entry.packets += info.packets.load(Relaxed);
            entry.data_records += info.data_records.load(Relaxed);
            entry.lost_records += info.lost_records.load(Relaxed);
        }

        let mut report = String::new();
        let runtime = begin.elapsed().as_secs();

        if out_path.is_some() {
            let _ = writeln!(report, "TIME={}", unix_time());
            let _ = writeln!(report, "RUNTIME={runtime}");
        } else {
            info!("");
            info!("runtime: {runtime} s");
            info!(
                "{:>10} {:>15} {:>15} {:>15} {:>12} {:>15} {:>20}",
                "ODID", "packets", "data rec.", "lost data rec.", "packets/s", "data records/s", "lost data records/s"
            );
        }

        let mut totals = OdidSnapshot::default();
        let mut odids: Vec<u32> = current.keys().copied().collect();
        odids.sort_unstable();
        for odid in &odids {
            let now = current[odid];
            let last = previous.get(odid).copied().unwrap_or_default();
            let rate = |a: u64, b: u64| (a.saturating_sub(b)) / settings.interval;

            if out_path.is_some() {
                let _ = writeln!(report, "PACKETS{odid}={}", now.packets);
                let _ = writeln!(report, "DATA_REC{odid}={}", now.data_records);
                let _ = writeln!(report, "LOST_DATA_REC{odid}={}", now.lost_records);
                let _ = writeln!(report, "PACKETS_SEC{odid}={}", rate(now.packets, last.packets));
                let _ = writeln!(
                    report,
                    "DATA_REC_SEC{odid}={}",
                    rate(now.data_records, last.data_records)
                );
                let _ = writeln!(
                    report,
                    "LOST_DATA_REC_SEC{odid}={}",
                    rate(now.lost_records, last.lost_records)
                );
            } else {
                info!(
                    "{:>10} {:>15} {:>15} {:>15} {:>12} {:>15} {:>20}",
                    odid,
                    now.packets,
                    now.data_records,
                    now.lost_records,
                    rate(now.packets, last.packets),
                    rate(now.data_records, last.data_records),
                    rate(now.lost_records, last.lost_records)
                );
            }

            totals.packets += now.packets;
            totals.data_records += now.data_records;
            totals.lost_records += now.lost_records;
        }

        if out_path.is_none() && odids.len() > 1 {
            info!("----------------------------------------------------------");
            info!(
                "{:>10} {:>15} {:>15} {:>15}",
                "Total:", totals.packets, totals.data_records, totals.lost_records
            );
        }
        previous = current;

        // Queue fill levels.
        if out_path.is_none() {
            info!("queue utilization:");
            for (name, len, capacity) in queues.snapshot() {
                info!("    {name}: {len} / {capacity}");
            }
            for (odid, len, capacity) in dm_depths() {
                info!("    data manager [{odid}]: {len} / {capacity}");
            }
        } else {
            for (name, len, capacity) in queues.snapshot() {
                let _ = writeln!(report, "QUEUE_{name}={len}/{capacity}");
            }
            for (odid, len, capacity) in dm_depths() {
                let _ = writeln!(report, "QUEUE_DM{odid}={len}/{capacity}");
            }
        }

        #[cfg(target_os = "linux")]
        cpu.report(out_path.is_some().then_some(&mut report));

        if let Some(path) = &out_path {
            if let Err(e) = std::fs::write(path, &report) {
                warn!("cannot write statistics file {}: {e}", path.display());
            }
        }
    }
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Per-thread CPU accounting from `/proc/self/task`.
#[cfg(target_os = "linux")]
mod cpu {
    use log::info;
    use std::collections::HashMap;
    use std::fmt::Write as _;

    #[derive(Default)]
    pub(super) struct CpuTracker {
        total_cpu: u64,
        threads: HashMap<i32, u64>,
    }

    fn total_cpu_time() -> u64 {
        let Ok(stat) = std::fs::read_to_string("/proc/stat") else {
            return 0;
        };
        let Some(line) = stat.lines().next() else { return 0 };
        line.split_whitespace()
            .skip(1)
            .take(4)
            .filter_map(|v| v.parse::<u64>().ok())
            .sum()
    }

    /// Parse `/proc/<pid>/task/<tid>/stat`: tid, (comm), state, then
    /// utime/stime at fields 14/15.
    fn parse_stat(content: &str) -> Option<(i32, String, char, u64)> {
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        let tid = content[..open].trim().parse().ok()?;
        let comm = content[open + 1..close].to_string();
        let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
        let state = rest.first()?.chars().next()?;
        let utime: u64 = rest.get(11)?.parse().ok()?;
        let stime: u64 = rest.get(12)?.parse().ok()?;
        Some((tid, comm, state, utime + stime))
    }

    impl CpuTracker {
        pub(super) fn report(&mut self, mut file_report: Option<&mut String>) {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(1);
            let total = total_cpu_time();
            let delta_total = total.saturating_sub(self.total_cpu);

            let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
                return;
            };

            if file_report.is_none() {
                info!("{:>10} {:>7} {:>10} {:>15}", "TID", "state", "cpu usage", "thread name");
            }

            for entry in tasks.flatten() {
                let stat_path = entry.path().join("stat");
                let Ok(content) = std::fs::read_to_string(stat_path) else {
                    continue;
                };
                let Some((tid, comm, state, proc_time)) = parse_stat(&content) else {
                    continue;
                };

                let last = self.threads.insert(tid, proc_time).unwrap_or(0);
                let usage = if last > 0 && delta_total > 0 {
                    cpus as f64 * (proc_time.saturating_sub(last)) as f64 * 100.0
                        / delta_total as f64
                } else {
                    0.0
                };

                match file_report.as_mut() {
                    Some(report) => {
                        let _ = writeln!(report, "CPU_{comm}={usage:.2}");
                    }
                    None => info!("{tid:>10} {state:>7} {usage:>8.2} % {comm:>15}"),
                }
            }

            self.total_cpu = total;
        }
    }
}
