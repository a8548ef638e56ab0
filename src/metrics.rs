//! Point-in-time host metrics attached to every poll. Every probe either
//! succeeds or degrades to a sentinel (`0` for numbers, `"Unknown"` for
//! strings); none of them can fail the polling loop.

use std::time::{Duration, Instant};

use crate::types::{AgentState, AgentStatus, StatusEnvelope};

const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(500);

/// Linux reports process CPU time in clock ticks; the kernel default is
/// 100 Hz and the agent does not link libc to ask.
#[cfg(target_os = "linux")]
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

pub struct SystemProbe {
    started: Instant,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Build the full envelope for a poll. Each field degrades to its
    /// sentinel independently.
    pub async fn envelope(
        &self,
        version: &str,
        status: AgentStatus,
        state: AgentState,
    ) -> StatusEnvelope {
        let cpu = self.cpu_usage_percent().await;
        let (total_ram_mb, ram_usage_mb) = ram_mb();
        let (disk_total_gb, disk_free_gb) = disk_gb();

        StatusEnvelope {
            agent_version: version.to_string(),
            status,
            state,
            cpu_usage_percent: cpu,
            ram_usage_mb,
            total_ram_mb,
            disk_total_gb,
            disk_free_gb,
            agent_uptime: self.uptime_string(),
            ip_address: local_ipv4(),
            operating_system: os_description(),
        }
    }

    /// Process CPU usage over a 500 ms window: CPU-time delta divided by
    /// `cores × wall-elapsed`, rounded to 0.1%.
    pub async fn cpu_usage_percent(&self) -> f64 {
        let Some(start_ticks) = process_cpu_ticks() else {
            return 0.0;
        };
        let wall_start = Instant::now();
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        let Some(end_ticks) = process_cpu_ticks() else {
            return 0.0;
        };

        let wall = wall_start.elapsed().as_secs_f64();
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1) as f64;
        if wall <= 0.0 {
            return 0.0;
        }

        let cpu_secs = ticks_to_secs(end_ticks.saturating_sub(start_ticks));
        let percent = (cpu_secs / (cores * wall)) * 100.0;
        (percent.clamp(0.0, 100.0) * 10.0).round() / 10.0
    }

    /// Process uptime formatted `dd:hh:mm:ss`.
    pub fn uptime_string(&self) -> String {
        format_uptime(self.started.elapsed())
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{days:02}:{hours:02}:{minutes:02}:{seconds:02}")
}

#[cfg(target_os = "linux")]
fn ticks_to_secs(ticks: u64) -> f64 {
    ticks as f64 / CLOCK_TICKS_PER_SEC
}

#[cfg(not(target_os = "linux"))]
fn ticks_to_secs(_ticks: u64) -> f64 {
    0.0
}

/// utime + stime from `/proc/self/stat`. The comm field may contain spaces,
/// so parsing starts after the closing paren.
#[cfg(target_os = "linux")]
fn process_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // after comm: state is field 0, utime is field 11, stime is field 12
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_ticks() -> Option<u64> {
    None
}

/// (total, used) in MB. Used is MemTotal − MemAvailable.
#[cfg(target_os = "linux")]
fn ram_mb() -> (u64, u64) {
    fn meminfo_kb(body: &str, key: &str) -> Option<u64> {
        body.lines()
            .find(|l| l.starts_with(key))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    }

    let Ok(body) = std::fs::read_to_string("/proc/meminfo") else {
        return (0, 0);
    };
    let total = meminfo_kb(&body, "MemTotal:").unwrap_or(0) / 1024;
    let available = meminfo_kb(&body, "MemAvailable:").unwrap_or(0) / 1024;
    (total, total.saturating_sub(available))
}

#[cfg(not(target_os = "linux"))]
fn ram_mb() -> (u64, u64) {
    (0, 0)
}

/// (total, free) of the drive hosting the working directory, in decimal GB.
#[cfg(unix)]
fn disk_gb() -> (f64, f64) {
    let Ok(cwd) = std::env::current_dir() else {
        return (0.0, 0.0);
    };
    let Ok(stat) = nix::sys::statvfs::statvfs(&cwd) else {
        return (0.0, 0.0);
    };
    let frag = stat.fragment_size() as f64;
    let total = stat.blocks() as f64 * frag / 1e9;
    let free = stat.blocks_available() as f64 * frag / 1e9;
    (total, free)
}

#[cfg(not(unix))]
fn disk_gb() -> (f64, f64) {
    (0.0, 0.0)
}

/// First non-loopback IPv4 of the host, discovered by the local address a
/// routed UDP socket would use. No packet is sent.
pub fn local_ipv4() -> String {
    let probe = || -> Option<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let addr = socket.local_addr().ok()?;
        if addr.ip().is_loopback() {
            return None;
        }
        Some(addr.ip().to_string())
    };
    probe().unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(target_os = "linux")]
pub fn os_description() -> String {
    let pretty = std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|body| {
            body.lines()
                .find(|l| l.starts_with("PRETTY_NAME="))
                .map(|l| l.trim_start_matches("PRETTY_NAME=").trim_matches('"').to_string())
        });
    pretty.unwrap_or_else(|| "Unknown".to_string())
}

#[cfg(not(target_os = "linux"))]
pub fn os_description() -> String {
    if std::env::consts::OS.is_empty() {
        "Unknown".to_string()
    } else {
        std::env::consts::OS.to_string()
    }
}
