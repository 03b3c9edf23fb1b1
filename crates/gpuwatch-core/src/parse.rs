//! Parsing of the fixed-field output produced by [`PROBE_COMMAND`].
//!
//! The GPU section is `nvidia-smi --query-gpu` CSV, one device per line:
//!
//! ```text
//! 0, GPU-5d1c..., Tesla V100-SXM2-16GB, 85, 15000, 16000, 65, 250.50
//! ```
//!
//! followed by [`PROCESS_MARKER`] and one line per compute process, with the
//! owner resolved on the remote side:
//!
//! ```text
//! GPU-5d1c..., 12345, alice, 2048, python train.py
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use gpuwatch_common::{DeviceReading, ProcessReading};

pub const PROCESS_MARKER: &str = "---PROCESSES---";

/// Remote command run by every probe. Exits non-zero only if the GPU query
/// itself fails.
pub const PROBE_COMMAND: &str = concat!(
    "nvidia-smi --query-gpu=index,uuid,name,utilization.gpu,memory.used,memory.total,temperature.gpu,power.draw ",
    "--format=csv,noheader,nounits",
    " && echo '---PROCESSES---'",
    " && nvidia-smi --query-compute-apps=gpu_uuid,pid,used_memory,process_name --format=csv,noheader,nounits",
    " | while IFS=',' read -r uuid pid mem name; do",
    " user=$(ps -o user:32= -p $pid 2>/dev/null | tr -d ' ');",
    " echo \"$uuid, $pid, ${user:-unknown}, $mem, $name\";",
    " done"
);

const GPU_FIELDS: usize = 8;
const PROCESS_FIELDS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProbe {
    pub devices: Vec<DeviceReading>,
    pub skipped_lines: usize,
}

/// Parse a probe's stdout. Malformed lines are skipped and counted; only a
/// missing section marker fails the whole parse.
pub fn parse_probe_output(stdout: &str) -> Result<ParsedProbe, String> {
    let Some((gpu_section, process_section)) = stdout.split_once(PROCESS_MARKER) else {
        return Err(format!("missing '{PROCESS_MARKER}' marker in probe output"));
    };

    let mut skipped_lines = 0;
    let mut devices: Vec<DeviceReading> = Vec::new();
    let mut uuid_to_index: HashMap<String, u32> = HashMap::new();

    for line in non_empty_lines(gpu_section) {
        match parse_gpu_line(line) {
            Some((uuid, device)) => {
                uuid_to_index.insert(uuid, device.index);
                devices.push(device);
            }
            None => {
                tracing::debug!(%line, "skipping malformed gpu line");
                skipped_lines += 1;
            }
        }
    }

    for line in non_empty_lines(process_section) {
        let parsed = parse_process_line(line).and_then(|(uuid, mut process)| {
            let index = *uuid_to_index.get(&uuid)?;
            process.device_index = index;
            Some(process)
        });
        let Some(process) = parsed else {
            tracing::debug!(%line, "skipping malformed process line");
            skipped_lines += 1;
            continue;
        };
        if let Some(device) = devices.iter_mut().find(|d| d.index == process.device_index) {
            device.processes.push(process);
        }
    }

    devices.sort_by_key(|d| d.index);
    Ok(ParsedProbe {
        devices,
        skipped_lines,
    })
}

fn non_empty_lines(section: &str) -> impl Iterator<Item = &str> {
    section.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn parse_gpu_line(line: &str) -> Option<(String, DeviceReading)> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < GPU_FIELDS {
        return None;
    }
    // The model name is the only field that could contain a comma.
    let tail = &parts[parts.len() - 5..];
    let name = parts[2..parts.len() - 5].join(",");

    let index = parts[0].parse::<u32>().ok()?;
    let uuid = parts[1].to_string();
    let utilization_percent = tail[0].parse::<u8>().ok().filter(|u| *u <= 100)?;
    let memory_used_mb = tail[1].parse::<u64>().ok()?;
    let memory_total_mb = tail[2].parse::<u64>().ok()?;
    if memory_used_mb > memory_total_mb || uuid.is_empty() {
        return None;
    }

    Some((
        uuid,
        DeviceReading {
            index,
            name,
            utilization_percent,
            memory_used_mb,
            memory_total_mb,
            temperature_c: optional(tail[3]),
            power_draw_w: optional(tail[4]),
            processes: Vec::new(),
        },
    ))
}

fn parse_process_line(line: &str) -> Option<(String, ProcessReading)> {
    let parts: Vec<&str> = line.splitn(PROCESS_FIELDS, ',').map(str::trim).collect();
    if parts.len() < PROCESS_FIELDS {
        return None;
    }
    let pid = parts[1].parse::<u32>().ok()?;
    let username = match parts[2] {
        "" => "unknown".to_string(),
        user => user.to_string(),
    };
    // used_memory is [N/A] under some drivers; the process is still real.
    let memory_used_mb = optional(parts[3]).unwrap_or(0);

    Some((
        parts[0].to_string(),
        ProcessReading {
            pid,
            username,
            device_index: 0,
            memory_used_mb,
            process_name: parts[4].to_string(),
        },
    ))
}

/// nvidia-smi prints `[N/A]`, `[Not Supported]` and friends for fields a
/// device does not report.
fn optional<T: FromStr>(raw: &str) -> Option<T> {
    if raw.starts_with('[') || raw.eq_ignore_ascii_case("N/A") {
        return None;
    }
    raw.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
0, GPU-aaaa, Tesla V100-SXM2-16GB, 85, 15000, 16000, 65, 250.50
1, GPU-bbbb, Tesla V100-SXM2-16GB, 45, 8000, 16000, [N/A], [Not Supported]
---PROCESSES---
GPU-aaaa, 12345, testuser, 2048, python train.py
GPU-bbbb, 67890, testuser, 4096, python inference.py
GPU-aaaa, 11111, otheruser, 1024, jupyter
";

    #[test]
    fn test_parse_sample_output() {
        let parsed = parse_probe_output(SAMPLE).unwrap();
        assert_eq!(parsed.skipped_lines, 0);
        assert_eq!(parsed.devices.len(), 2);

        let gpu0 = &parsed.devices[0];
        assert_eq!(gpu0.index, 0);
        assert_eq!(gpu0.name, "Tesla V100-SXM2-16GB");
        assert_eq!(gpu0.utilization_percent, 85);
        assert_eq!(gpu0.memory_free_mb(), 1000);
        assert_eq!(gpu0.temperature_c, Some(65));
        assert_eq!(gpu0.power_draw_w, Some(250.5));
        assert_eq!(gpu0.processes.len(), 2);
        assert_eq!(gpu0.processes[0].pid, 12345);
        assert_eq!(gpu0.processes[1].username, "otheruser");

        let gpu1 = &parsed.devices[1];
        assert_eq!(gpu1.temperature_c, None);
        assert_eq!(gpu1.power_draw_w, None);
        assert_eq!(gpu1.processes[0].device_index, 1);
        assert_eq!(gpu1.processes[0].memory_used_mb, 4096);
    }

    #[test]
    fn test_malformed_lines_are_counted_not_fatal() {
        let out = "\
0, GPU-aaaa, A100, 10, 100, 80000, 40, 100.0
garbage line
1, GPU-bbbb, A100, 140, 100, 80000, 40, 100.0
2, GPU-cccc, A100, 10, 90000, 80000, 40, 100.0
---PROCESSES---
GPU-aaaa, notapid, bob, 10, python
GPU-zzzz, 42, bob, 10, python
GPU-aaaa, 43, bob, 10, python
";
        let parsed = parse_probe_output(out).unwrap();
        assert_eq!(parsed.devices.len(), 1);
        assert_eq!(parsed.devices[0].processes.len(), 1);
        assert_eq!(parsed.devices[0].processes[0].pid, 43);
        // bad line, util > 100, used > total, bad pid, unknown uuid
        assert_eq!(parsed.skipped_lines, 5);
    }

    #[test]
    fn test_process_name_may_contain_commas() {
        let out = "\
0, GPU-aaaa, A100, 10, 100, 80000, 40, 100.0
---PROCESSES---
GPU-aaaa, 7, carol, [N/A], python -c import a, b
";
        let parsed = parse_probe_output(out).unwrap();
        let p = &parsed.devices[0].processes[0];
        assert_eq!(p.process_name, "python -c import a, b");
        assert_eq!(p.memory_used_mb, 0);
    }

    #[test]
    fn test_missing_marker_is_parse_error() {
        assert!(parse_probe_output("0, GPU-aaaa, A100, 10, 100, 80000, 40, 100.0\n").is_err());
    }

    #[test]
    fn test_idle_host_without_processes() {
        let out = "0, GPU-aaaa, A100, 0, 0, 80000, 30, 50.0\n---PROCESSES---\n";
        let parsed = parse_probe_output(out).unwrap();
        assert_eq!(parsed.devices.len(), 1);
        assert!(parsed.devices[0].processes.is_empty());
    }

    #[test]
    fn test_probe_command_emits_marker() {
        assert!(PROBE_COMMAND.contains(PROCESS_MARKER));
    }
}
