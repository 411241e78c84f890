//! Platform-agnostic process control functions.

use std::net::IpAddr;

use crate::error::{OrchestratorError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    super::win_api::is_process_alive(pid)
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Check if a process is a zombie. Signal-0 succeeds for zombies, so the
/// process probe asks this separately.
#[cfg(target_os = "linux")]
pub fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // comm may contain spaces; the state field follows the closing paren.
    stat.rsplit_once(')')
        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
pub fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send a graceful terminate to the process group rooted at `pid`.
#[cfg(not(target_os = "windows"))]
pub fn terminate_group(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, Signal::SIGTERM).map_err(|e| {
            OrchestratorError::process(format!(
                "Failed to send SIGTERM to group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Err(e) => kill(target, Signal::SIGTERM).map_err(|kill_err| {
            OrchestratorError::process(format!(
                "Failed to send SIGTERM to pid {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

/// Send a graceful terminate to the process tree rooted at `pid`.
#[cfg(target_os = "windows")]
pub fn terminate_group(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output()
        .map_err(|e| OrchestratorError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(OrchestratorError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            stderr.trim()
        )))
    }
}

/// Force-kill the process group rooted at `pid`.
#[cfg(not(target_os = "windows"))]
pub fn kill_group(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            OrchestratorError::process(format!(
                "Failed to kill process group {} (from pid {}): {}",
                pgid.as_raw(),
                pid,
                e
            ))
        }),
        Err(e) => kill(target, Signal::SIGKILL).map_err(|kill_err| {
            OrchestratorError::process(format!(
                "Failed to kill process {} (getpgid failed: {}): {}",
                pid, e, kill_err
            ))
        }),
    }
}

/// Force-kill the process tree rooted at `pid`.
#[cfg(target_os = "windows")]
pub fn kill_group(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map_err(|e| OrchestratorError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            stdout.trim()
        } else {
            detail
        };
        Err(OrchestratorError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            if detail.is_empty() {
                "(no output)"
            } else {
                detail
            }
        )))
    }
}

/// Local TCP addresses the process is listening on, or `None` when the
/// platform exposes no per-process binding table.
#[cfg(target_os = "linux")]
pub fn listening_tcp(pid: u32) -> Option<Vec<(IpAddr, u16)>> {
    let inodes = socket_inodes(pid)?;
    let mut out = Vec::new();
    collect_listeners("/proc/net/tcp", &inodes, &mut out);
    collect_listeners("/proc/net/tcp6", &inodes, &mut out);
    Some(out)
}

#[cfg(target_os = "linux")]
fn socket_inodes(pid: u32) -> Option<std::collections::HashSet<u64>> {
    let entries = std::fs::read_dir(format!("/proc/{}/fd", pid)).ok()?;
    let mut inodes = std::collections::HashSet::new();
    for entry in entries.flatten() {
        let Ok(target) = std::fs::read_link(entry.path()) else {
            continue;
        };
        let target = target.to_string_lossy();
        if let Some(inode) = target
            .strip_prefix("socket:[")
            .and_then(|s| s.strip_suffix(']'))
        {
            if let Ok(inode) = inode.parse::<u64>() {
                inodes.insert(inode);
            }
        }
    }
    Some(inodes)
}

/// Parse LISTEN entries (state 0A) whose inode belongs to the process.
#[cfg(target_os = "linux")]
fn collect_listeners(
    table: &str,
    inodes: &std::collections::HashSet<u64>,
    out: &mut Vec<(IpAddr, u16)>,
) {
    let Ok(content) = std::fs::read_to_string(table) else {
        return;
    };
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != "0A" {
            continue;
        }
        let Ok(inode) = fields[9].parse::<u64>() else {
            continue;
        };
        if !inodes.contains(&inode) {
            continue;
        }
        if let Some((ip, port)) = parse_local_address(fields[1]) {
            out.push((ip, port));
        }
    }
}

/// Decode the kernel's `hexaddr:hexport` local address notation.
#[cfg(target_os = "linux")]
fn parse_local_address(field: &str) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    match addr_hex.len() {
        8 => {
            // IPv4: one 32-bit word in host byte order.
            let word = u32::from_str_radix(addr_hex, 16).ok()?;
            let octets = word.to_ne_bytes();
            Some((IpAddr::from(octets), port))
        }
        32 => {
            // IPv6: four 32-bit words, each in host byte order.
            let mut bytes = [0u8; 16];
            for (i, chunk) in addr_hex.as_bytes().chunks(8).enumerate() {
                let word = u32::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
                bytes[i * 4..(i + 1) * 4].copy_from_slice(&word.to_ne_bytes());
            }
            Some((IpAddr::from(bytes), port))
        }
        _ => None,
    }
}

/// Local TCP addresses the process is listening on.
#[cfg(target_os = "windows")]
pub fn listening_tcp(pid: u32) -> Option<Vec<(IpAddr, u16)>> {
    Some(super::win_api::listening_tcp(pid))
}

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub fn listening_tcp(_pid: u32) -> Option<Vec<(IpAddr, u16)>> {
    None
}

#[cfg(test)]
mod tests {
    use super::is_process_alive;

    #[test]
    fn own_pid_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn listener_appears_in_binding_table() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let bindings = super::listening_tcp(std::process::id()).unwrap();
        assert!(
            bindings.iter().any(|(_, p)| *p == port),
            "expected port {} in {:?}",
            port,
            bindings
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parse_local_address_decodes_loopback() {
        // 127.0.0.1:8080 as the kernel prints it on little-endian.
        let (ip, port) = super::parse_local_address("0100007F:1F90").unwrap();
        assert_eq!(ip.to_string(), "127.0.0.1");
        assert_eq!(port, 8080);
    }
}
