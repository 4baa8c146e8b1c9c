use foreman_common::types::HardwareTelemetry;

/// Sample hardware telemetry from /proc. Non-Linux hosts and sandboxes
/// without /proc report zeros, which keeps the worker selectable.
pub fn sample() -> HardwareTelemetry {
    HardwareTelemetry {
        cpu_percent: cpu_percent().unwrap_or(0.0),
        memory_percent: memory_percent().unwrap_or(0.0),
        temperature: None,
    }
}

/// One-minute load average scaled by core count, as a rough cpu%.
fn cpu_percent() -> Option<f64> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let one_minute: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;
    Some((one_minute / cores * 100.0).min(100.0))
}

/// Used memory fraction from /proc/meminfo.
fn memory_percent() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total_kb: Option<f64> = None;
    let mut available_kb: Option<f64> = None;

    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = rest.split_whitespace().next()?.parse().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = rest.split_whitespace().next()?.parse().ok();
        }
    }

    let total = total_kb?;
    let available = available_kb?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_stays_in_range() {
        let telemetry = sample();
        assert!((0.0..=100.0).contains(&telemetry.cpu_percent));
        assert!((0.0..=100.0).contains(&telemetry.memory_percent));
    }
}
