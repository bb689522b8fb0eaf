//! Enters a list of existing namespaces named as `kind:path` pairs
//! (SPEC_FULL.md §4.4). Two passes are mandatory: opening every path must
//! happen before entering any namespace, since entering the mount
//! namespace can make it impossible to open further host paths.

use std::fs::File;

use nix::sched::{setns, CloneFlags};

use crate::error::{Context, Result};

fn flags_for_kind(kind: &str) -> CloneFlags {
    match kind {
        "cgroup" => CloneFlags::CLONE_NEWCGROUP,
        "ipc" => CloneFlags::CLONE_NEWIPC,
        "mnt" => CloneFlags::CLONE_NEWNS,
        "net" => CloneFlags::CLONE_NEWNET,
        "pid" => CloneFlags::CLONE_NEWPID,
        "user" => CloneFlags::CLONE_NEWUSER,
        "uts" => CloneFlags::CLONE_NEWUTS,
        _ => CloneFlags::empty(),
    }
}

/// Opens and enters every `(kind, path)` pair in order. All opens happen
/// before any `setns` call.
pub(crate) fn join_namespaces(ns_paths: &[(String, String)]) -> Result<()> {
    if ns_paths.is_empty() {
        return Ok(());
    }
    let mut opened = Vec::with_capacity(ns_paths.len());
    for (kind, path) in ns_paths {
        let file = File::open(path).context(format!("opening namespace {kind}:{path}"))?;
        opened.push((kind.as_str(), file));
    }
    for (kind, file) in &opened {
        setns(file, flags_for_kind(kind)).context(format!("entering {kind} namespace"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ns_paths_is_a_no_op() {
        join_namespaces(&[]).unwrap();
    }

    #[test]
    fn unknown_kind_maps_to_empty_flags() {
        assert_eq!(flags_for_kind("bogus"), CloneFlags::empty());
    }

    #[test]
    fn known_kinds_map_to_distinct_flags() {
        let kinds = ["cgroup", "ipc", "mnt", "net", "pid", "user", "uts"];
        for kind in kinds {
            assert_ne!(flags_for_kind(kind), CloneFlags::empty());
        }
    }
}
