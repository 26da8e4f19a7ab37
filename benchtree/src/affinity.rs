//! Worker placement near the RDMA device.
//!
//! Cores on the device's NUMA node come first; cores 0 and 1 are used last
//! since they usually serve interrupts.

use std::collections::HashSet;
use std::fs;

fn pin_to_core(core_id: usize) -> Result<(), i32> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret == 0 {
            Ok(())
        } else {
            Err(*libc::__errno_location())
        }
    }
}

/// Parse a sysfs cpulist such as `0-15,32-47`.
fn parse_cpulist(s: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    for part in s.trim().split(',').map(str::trim) {
        if let Some((a, b)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (a.parse::<usize>(), b.parse::<usize>()) {
                cores.extend(start..=end);
            }
        } else if let Ok(c) = part.parse::<usize>() {
            cores.push(c);
        }
    }
    cores.sort_unstable();
    cores.dedup();
    cores
}

fn node_cores(node: usize) -> Option<Vec<usize>> {
    fs::read_to_string(format!("/sys/devices/system/node/node{node}/cpulist"))
        .ok()
        .map(|s| parse_cpulist(&s))
}

fn numa_nodes() -> Vec<usize> {
    let mut nodes: Vec<usize> = fs::read_dir("/sys/devices/system/node")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .strip_prefix("node")
                .and_then(|s| s.parse().ok())
        })
        .collect();
    nodes.sort_unstable();
    nodes
}

fn online_cores() -> Vec<usize> {
    if let Ok(s) = fs::read_to_string("/sys/devices/system/cpu/online") {
        return parse_cpulist(&s);
    }
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    (0..n.max(1) as usize).collect()
}

fn device_numa_node(device_index: usize) -> Option<usize> {
    fs::read_to_string(format!(
        "/sys/class/infiniband/mlx5_{device_index}/device/numa_node"
    ))
    .ok()
    .and_then(|s| s.trim().parse::<isize>().ok())
    .and_then(|n| usize::try_from(n).ok())
}

/// Order `all` by preference given the cores of the device's node.
fn order_cores(all: &[usize], preferred: &HashSet<usize>) -> Vec<usize> {
    let tiers: [fn(usize, bool) -> bool; 4] = [
        |c, near| c >= 2 && near,
        |c, near| c >= 2 && !near,
        |c, near| c < 2 && near,
        |c, near| c < 2 && !near,
    ];
    tiers
        .iter()
        .flat_map(|tier| {
            all.iter()
                .copied()
                .filter(move |c| tier(*c, preferred.contains(c)))
        })
        .collect()
}

/// Cores for worker threads, best first.
pub fn available_cores(device_index: usize) -> Vec<usize> {
    let mut all: Vec<usize> = numa_nodes().into_iter().filter_map(node_cores).flatten().collect();
    if all.is_empty() {
        all = online_cores();
    }
    all.sort_unstable();
    all.dedup();

    let preferred: HashSet<usize> = device_numa_node(device_index)
        .and_then(node_cores)
        .unwrap_or_default()
        .into_iter()
        .collect();
    let ordered = order_cores(&all, &preferred);
    if ordered.is_empty() { online_cores() } else { ordered }
}

/// One core per worker thread; threads beyond the available cores float.
pub fn worker_cores(available: &[usize], threads: usize) -> Vec<Option<usize>> {
    if available.len() < threads {
        tracing::warn!(
            cores = available.len(),
            threads,
            "not enough cores, some worker threads stay unpinned"
        );
    }
    (0..threads).map(|t| available.get(t).copied()).collect()
}

/// Pin the calling thread; failure only degrades placement.
pub fn pin_thread(core_id: usize, thread_id: usize) {
    match pin_to_core(core_id) {
        Ok(()) => tracing::debug!(thread_id, core_id, "pinned"),
        Err(errno) => tracing::warn!(thread_id, core_id, errno, "failed to pin thread"),
    }
}
