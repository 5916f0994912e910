use crate::errors::ToolError;
use crate::services::host::{CaptureLimits, ExecOptions, Host};
use crate::stores::inventory_store::MachineInfo;
use chrono::Utc;

const INFO_CAPTURE_BYTES: usize = 16 * 1024;

/// Emits one `key=value` line per fact. Missing tools leave their key out.
const INFO_SCRIPT: &str = r#"
os=$( (test -f /etc/os-release && . /etc/os-release && echo "$PRETTY_NAME") 2>/dev/null || true)
[ -n "$os" ] || os=$(uname -s 2>/dev/null)
echo "os=$os"
echo "arch=$(uname -m 2>/dev/null)"
cpu=$( (lscpu 2>/dev/null || cat /proc/cpuinfo 2>/dev/null) | grep -i -m 1 'model name' | cut -d: -f2-)
echo "cpu=$cpu"
echo "cores=$(nproc 2>/dev/null || getconf _NPROCESSORS_ONLN 2>/dev/null)"
mem=$(free -h 2>/dev/null | grep -m 1 '^Mem:')
[ -n "$mem" ] || mem=$(grep -m 1 '^MemTotal:' /proc/meminfo 2>/dev/null)
echo "mem=$mem"
echo "disk=$(df -h / 2>/dev/null | tail -n 1)"
"#;

/// Folds `key=value` lines into `info`. Blank values and unknown keys are skipped.
pub fn parse_info(raw: &str, info: &mut MachineInfo) {
    for line in raw.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "os" => info.os = Some(value),
            "arch" => info.arch = Some(value),
            "cpu" => info.cpu = Some(value),
            "cores" => info.cores = value.parse::<u32>().ok().filter(|n| *n > 0),
            "mem" => info.mem = Some(value),
            "disk" => info.disk = Some(value),
            _ => {}
        }
    }
}

pub async fn collect_machine_info(host: &dyn Host, name: &str) -> Result<MachineInfo, ToolError> {
    let result = host
        .exec(
            INFO_SCRIPT,
            ExecOptions::with_limits(CaptureLimits::new(INFO_CAPTURE_BYTES, INFO_CAPTURE_BYTES)),
        )
        .await?;
    let mut info = MachineInfo {
        name: name.to_string(),
        updated_at: Utc::now(),
        ..MachineInfo::default()
    };
    parse_info(&result.stdout, &mut info);
    if !result.succeeded() {
        let detail = result.combined_output();
        info.error = Some(if detail.is_empty() {
            format!("info script exited with {:?}", result.exit_code)
        } else {
            detail
        });
    }
    Ok(info)
}
