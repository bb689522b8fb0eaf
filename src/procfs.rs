//! Writers for the small `/proc/<pid>/...` files used during namespace
//! setup: the setgroups policy, uid/gid maps (with external-helper
//! fallback), and oom_score_adj. Mirrors the ordering rules the kernel
//! enforces around user namespaces.

use std::io::ErrorKind;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::prctl;

use crate::error::{Context, Error, Result};
use crate::syscall::Pid;

/// Matches the original program's argv cap for the new{u,g}idmap helper
/// invocation (MAX_ARGV = 20 in nsexec.c); at least 16 tokens per
/// SPEC_FULL.md §4.3.
const MAX_ARGV: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetgroupsPolicy {
    Allow,
    Deny,
}

impl SetgroupsPolicy {
    fn as_str(self) -> &'static str {
        match self {
            SetgroupsPolicy::Allow => "allow",
            SetgroupsPolicy::Deny => "deny",
        }
    }
}

fn write_proc_file(path: String, data: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, data)
}

/// Writes the setgroups policy for `pid`. A missing file (older kernels)
/// is tolerated; any other failure is fatal.
pub(crate) fn write_setgroups(pid: Pid, policy: SetgroupsPolicy) -> Result<()> {
    let path = format!("/proc/{pid}/setgroups");
    match write_proc_file(path.clone(), policy.as_str().as_bytes()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("writing {path}")),
    }
}

/// Writes `map` to `/proc/<pid>/{uid,gid}_map`. On EPERM, falls back to
/// spawning the external mapping tool at `tool_path` with the map
/// reformatted as argv tokens. `kind` selects "uid"/"gid" for error text.
pub(crate) fn write_id_map(
    pid: Pid,
    kind: &str,
    map: &str,
    tool_path: Option<&str>,
) -> Result<()> {
    if map.is_empty() {
        return Ok(());
    }
    let path = format!("/proc/{pid}/{kind}_map");
    match write_proc_file(path.clone(), map.as_bytes()) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            let tool_path = tool_path.ok_or_else(|| {
                Error::new(format!(
                    "writing {path} denied and no {kind}-mapping helper configured"
                ))
            })?;
            run_mapping_tool(tool_path, pid, map)
                .context(format!("running {kind}-mapping helper"))
        }
        Err(err) => Err(err).context(format!("writing {path}")),
    }
}

fn run_mapping_tool(tool_path: &str, pid: Pid, map: &str) -> Result<()> {
    let mut argv: Vec<&str> = Vec::with_capacity(MAX_ARGV);
    let pid_str = pid.as_raw().to_string();
    argv.push(&pid_str);
    for token in map.split_whitespace() {
        if argv.len() >= MAX_ARGV {
            break;
        }
        argv.push(token);
    }
    let status = Command::new(tool_path)
        .args(&argv)
        .status()
        .context(format!("spawning {tool_path}"))?;
    if !status.success() {
        return Err(Error::new(format!(
            "{tool_path} exited with {status}"
        )));
    }
    Ok(())
}

/// Writes `/proc/self/oom_score_adj`. Empty data is a documented no-op
/// (the unconditional initial `-999` write is issued separately by the
/// bootstrap entry and is never empty).
pub(crate) fn write_oom_score_adj(data: &str) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    std::fs::write("/proc/self/oom_score_adj", data.as_bytes())
        .context("writing /proc/self/oom_score_adj")
}

/// Toggles `PR_SET_DUMPABLE`, returning a guard that restores the previous
/// value on drop. Used around self-writes to `/proc` that would otherwise
/// be blocked once the process becomes non-dumpable after user-ns setup.
pub(crate) struct DumpableGuard {
    previous: bool,
}

impl DumpableGuard {
    pub fn set(dumpable: bool) -> Result<Self> {
        let previous = get_dumpable()?;
        set_dumpable(dumpable)?;
        Ok(Self { previous })
    }
}

impl Drop for DumpableGuard {
    fn drop(&mut self) {
        let _ = set_dumpable(self.previous);
    }
}

pub(crate) fn get_dumpable() -> Result<bool> {
    let value = prctl::get_dumpable().context("prctl(PR_GET_DUMPABLE)")?;
    Ok(value)
}

pub(crate) fn set_dumpable(dumpable: bool) -> Result<()> {
    prctl::set_dumpable(dumpable).context("prctl(PR_SET_DUMPABLE)")?;
    Ok(())
}

pub(crate) fn set_name(name: &str) -> Result<()> {
    match prctl::set_name(name) {
        Ok(()) => Ok(()),
        Err(Errno::EINVAL) => Ok(()),
        Err(err) => Err(err).context("prctl(PR_SET_NAME)"),
    }
}
