//! Host CPU, load and memory, read from procfs on Linux and through
//! `sysinfo` elsewhere.

use std::path::PathBuf;

use llamactl_common::HostMetrics;

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    /// user + nice + system
    pub active: u64,
    pub idle: u64,
}

pub fn parse_cpu_ticks(stat: &str) -> Option<CpuTicks> {
    let rest = stat.lines().find_map(|l| l.strip_prefix("cpu "))?;
    let fields: Vec<u64> = rest
        .split_whitespace()
        .take(4)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.len() < 4 {
        return None;
    }
    Some(CpuTicks { active: fields[0] + fields[1] + fields[2], idle: fields[3] })
}

/// Utilization between two samples; zero when no time has passed or the
/// counters went backwards.
pub fn cpu_percent(prev: CpuTicks, cur: CpuTicks) -> u32 {
    let active = cur.active.saturating_sub(prev.active);
    let total = active + cur.idle.saturating_sub(prev.idle);
    if total == 0 { 0 } else { (active * 100 / total) as u32 }
}

pub fn parse_loadavg(text: &str) -> Option<(f64, f64, f64)> {
    let mut it = text.split_whitespace().map(str::parse::<f64>);
    match (it.next(), it.next(), it.next()) {
        (Some(Ok(a)), Some(Ok(b)), Some(Ok(c))) => Some((a, b, c)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMib {
    pub mem_total: u64,
    pub mem_used: u64,
    pub swap_total: u64,
    pub swap_used: u64,
}

/// Reads `/proc/meminfo` (KiB). Used memory is total minus available.
pub fn parse_meminfo(text: &str) -> Option<MemoryMib> {
    let (mut total, mut available, mut swap_total, mut swap_free) = (None, None, 0, 0);
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else { continue };
        let Some(kib) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        match key {
            "MemTotal" => total = Some(kib),
            "MemAvailable" => available = Some(kib),
            "SwapTotal" => swap_total = kib,
            "SwapFree" => swap_free = kib,
            _ => {}
        }
    }
    let total = total? / 1024;
    let available = available.unwrap_or(0) / 1024;
    let swap_total = swap_total / 1024;
    Some(MemoryMib {
        mem_total: total,
        mem_used: total.saturating_sub(available),
        swap_total,
        swap_used: swap_total.saturating_sub(swap_free / 1024),
    })
}

/// Keeps the previous CPU counters between polls. A source that fails to
/// read leaves its fields at the last good values.
pub struct HostSampler {
    proc_root: PathBuf,
    prev_ticks: Option<CpuTicks>,
    last: HostMetrics,
    #[cfg(not(target_os = "linux"))]
    sys: sysinfo::System,
}

impl Default for HostSampler {
    fn default() -> Self { Self::with_proc_root("/proc") }
}

impl HostSampler {
    pub fn new() -> Self { Self::default() }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
            prev_ticks: None,
            last: HostMetrics::default(),
            #[cfg(not(target_os = "linux"))]
            sys: sysinfo::System::new(),
        }
    }

    async fn read(&self, name: &str) -> Option<String> {
        tokio::fs::read_to_string(self.proc_root.join(name)).await.ok()
    }

    #[cfg(target_os = "linux")]
    pub async fn sample(&mut self) -> HostMetrics {
        self.sample_procfs().await
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn sample(&mut self) -> HostMetrics {
        if self.proc_root.join("stat").exists() {
            return self.sample_procfs().await;
        }
        self.sys.refresh_cpu();
        self.sys.refresh_memory();
        let load = sysinfo::System::load_average();
        let mib = |bytes: u64| bytes / 1024 / 1024;
        self.last = HostMetrics {
            cpu_percent: self.sys.global_cpu_info().cpu_usage().round() as u32,
            load_avg_1: load.one,
            load_avg_5: load.five,
            load_avg_15: load.fifteen,
            mem_total_mib: mib(self.sys.total_memory()),
            mem_used_mib: mib(self.sys.total_memory().saturating_sub(self.sys.available_memory())),
            swap_total_mib: mib(self.sys.total_swap()),
            swap_used_mib: mib(self.sys.used_swap()),
        };
        self.last.clone()
    }

    async fn sample_procfs(&mut self) -> HostMetrics {
        if let Some(cur) = self.read("stat").await.as_deref().and_then(parse_cpu_ticks) {
            // the first sample only primes the counters
            if let Some(prev) = self.prev_ticks {
                self.last.cpu_percent = cpu_percent(prev, cur);
                if let Some((one, five, fifteen)) = self.read("loadavg").await.as_deref().and_then(parse_loadavg) {
                    self.last.load_avg_1 = one;
                    self.last.load_avg_5 = five;
                    self.last.load_avg_15 = fifteen;
                }
            }
            self.prev_ticks = Some(cur);
        }
        if let Some(mem) = self.read("meminfo").await.as_deref().and_then(parse_meminfo) {
            self.last.mem_total_mib = mem.mem_total;
            self.last.mem_used_mib = mem.mem_used;
            self.last.swap_total_mib = mem.swap_total;
            self.last.swap_used_mib = mem.swap_used;
        }
        self.last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEMINFO: &str = "MemTotal:       65536000 kB\n\
                           MemFree:         1024000 kB\n\
                           MemAvailable:   32768000 kB\n\
                           SwapTotal:       8192000 kB\n\
                           SwapFree:        6144000 kB\n";

    #[test]
    fn cpu_ticks_from_aggregate_line() {
        let stat = "cpu  100 5 50 1000 7 0 0 0 0 0\ncpu0 50 2 25 500 3 0 0 0 0 0\n";
        assert_eq!(parse_cpu_ticks(stat), Some(CpuTicks { active: 155, idle: 1000 }));
        assert_eq!(parse_cpu_ticks("cpu0 1 2 3 4\n"), None);
        assert_eq!(parse_cpu_ticks("cpu  1 2 x 4\n"), None);
    }

    #[test]
    fn cpu_percent_from_deltas() {
        let prev = CpuTicks { active: 100, idle: 900 };
        assert_eq!(cpu_percent(prev, CpuTicks { active: 125, idle: 975 }), 25);
        assert_eq!(cpu_percent(prev, prev), 0);
    }

    #[test]
    fn loadavg_takes_first_three_fields() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 2/1234 56789\n"), Some((0.52, 0.58, 0.59)));
        assert_eq!(parse_loadavg("0.52\n"), None);
    }

    #[test]
    fn meminfo_converts_to_mib() {
        let m = parse_meminfo(MEMINFO).unwrap();
        assert_eq!(m.mem_total, 64000);
        assert_eq!(m.mem_used, 32000);
        assert_eq!(m.swap_total, 8000);
        assert_eq!(m.swap_used, 2000);
        assert!(parse_meminfo("SwapTotal: 0 kB\n").is_none());
    }

    #[tokio::test]
    async fn sampler_primes_then_reports_cpu() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        std::fs::write(dir.path().join("loadavg"), "1.00 2.00 3.00 1/100 42\n").unwrap();
        std::fs::write(dir.path().join("stat"), "cpu  100 0 0 900 0\n").unwrap();

        let mut sampler = HostSampler::with_proc_root(dir.path());
        let first = sampler.sample().await;
        assert_eq!(first.cpu_percent, 0);
        assert_eq!(first.load_avg_1, 0.0);
        assert_eq!(first.mem_used_mib, 32000);

        std::fs::write(dir.path().join("stat"), "cpu  150 0 0 950 0\n").unwrap();
        let second = sampler.sample().await;
        assert_eq!(second.cpu_percent, 50);
        assert_eq!(second.load_avg_15, 3.0);
    }

    #[tokio::test]
    async fn unreadable_source_keeps_last_values() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        let mut sampler = HostSampler::with_proc_root(dir.path());
        assert_eq!(sampler.sample().await.mem_total_mib, 64000);
        std::fs::remove_file(dir.path().join("meminfo")).unwrap();
        assert_eq!(sampler.sample().await.mem_total_mib, 64000);
    }
}
