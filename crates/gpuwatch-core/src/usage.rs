use gpuwatch_common::{FleetSnapshot, HostProcesses, UserUsage};

/// Everything `username` is running according to `fleet`, optionally
/// restricted to one host. Unreachable hosts contribute nothing.
pub fn user_usage(fleet: &FleetSnapshot, username: &str, host_scope: Option<&str>) -> UserUsage {
    let processes_by_host: Vec<HostProcesses> = fleet
        .hosts
        .iter()
        .filter(|h| h.reachable)
        .filter(|h| host_scope.map_or(true, |scope| h.host_id == scope))
        .filter_map(|h| {
            let processes: Vec<_> = h
                .processes()
                .filter(|p| p.username == username)
                .cloned()
                .collect();
            (!processes.is_empty()).then(|| HostProcesses {
                host_id: h.host_id.clone(),
                processes,
            })
        })
        .collect();

    let total_processes = processes_by_host.iter().map(|h| h.processes.len()).sum();
    let total_memory_mb = processes_by_host
        .iter()
        .flat_map(|h| h.processes.iter())
        .map(|p| p.memory_used_mb)
        .sum();

    UserUsage {
        username: username.to_string(),
        total_processes,
        total_memory_mb,
        servers: processes_by_host.iter().map(|h| h.host_id.clone()).collect(),
        processes_by_host,
        captured_at: fleet.captured_at,
        degraded: fleet.degraded,
    }
}
