//! Parses the length-delimited, 4-byte-aligned attribute message the
//! manager sends over the init pipe, and serializes the small JSON
//! replies sent back over the same pipe.

use std::io::Read;

use serde::Serialize;

use crate::error::{Context, Error, Result};

const INIT_MSG: u16 = 62000;

const CLONE_FLAGS_ATTR: u16 = 27281;
const NS_PATHS_ATTR: u16 = 27282;
const UIDMAP_ATTR: u16 = 27283;
const GIDMAP_ATTR: u16 = 27284;
const SETGROUP_ATTR: u16 = 27285;
const OOM_SCORE_ADJ_ATTR: u16 = 27286;
const ROOTLESS_EUID_ATTR: u16 = 27287;
const UIDMAPPATH_ATTR: u16 = 27288;
const GIDMAPPATH_ATTR: u16 = 27289;
const PREP_ROOTFS_ATTR: u16 = 27290;
const MAKE_PARENT_PRIV_ATTR: u16 = 27291;
const ROOTFS_PROP_ATTR: u16 = 27292;
const ROOTFS_ATTR: u16 = 27293;
const PARENT_MOUNT_ATTR: u16 = 27294;
const SHIFTFS_MOUNTS_ATTR: u16 = 27295;

/// Byte read from the manager's init pipe by stage 2 meaning "cgroup
/// namespace may now be created".
pub const CREATE_CGROUPNS: u8 = 0x80;

/// Parsed bootstrap message. Every byte-string field is owned: the
/// message buffer does not outlive parsing, and config values must
/// survive across `fork()` into later stages.
#[derive(Debug, Default, Clone)]
pub struct BootstrapConfig {
    pub clone_flags: u32,
    pub ns_paths: Vec<(String, String)>,
    pub uid_map: String,
    pub gid_map: String,
    pub setgroups_requested: bool,
    pub oom_score_adj: String,
    pub rootless_euid: bool,
    pub uid_map_path: Option<String>,
    pub gid_map_path: Option<String>,
    pub prep_rootfs: bool,
    pub make_parent_priv: bool,
    pub rootfs_prop: u32,
    pub rootfs: String,
    pub parent_mount: String,
    pub shiftfs_mounts: Vec<String>,
}

#[derive(Serialize)]
pub struct PidReport {
    pub pid: i32,
    pub pid_first: i32,
}

pub fn write_pid_report(mut tx: impl std::io::Write, pid: i32, pid_first: i32) -> Result<()> {
    let report = PidReport { pid, pid_first };
    let mut line = serde_json::to_string(&report)?;
    line.push('\n');
    tx.write_all(line.as_bytes())
        .context("writing pid report")?;
    Ok(())
}

/// Reads the header + attribute payload from the init pipe and parses it
/// into a [`BootstrapConfig`].
pub fn read_config(mut rx: impl Read) -> Result<BootstrapConfig> {
    let mut header = [0u8; 4];
    rx.read_exact(&mut header)
        .context("reading init message header")?;
    let msg_type = u16::from_ne_bytes([header[0], header[1]]);
    let msg_len = u16::from_ne_bytes([header[2], header[3]]) as usize;
    if msg_type != INIT_MSG {
        return Err(Error::new(format!(
            "unexpected init message type {msg_type}"
        )));
    }
    let mut payload = vec![0u8; msg_len];
    rx.read_exact(&mut payload)
        .context("reading init message payload")?;
    parse_attrs(&payload)
}

fn parse_attrs(payload: &[u8]) -> Result<BootstrapConfig> {
    let mut config = BootstrapConfig::default();
    let mut offset = 0usize;
    while offset < payload.len() {
        if offset + 4 > payload.len() {
            return Err(Error::new("truncated attribute header"));
        }
        let attr_type = u16::from_ne_bytes([payload[offset], payload[offset + 1]]);
        let attr_len = u16::from_ne_bytes([payload[offset + 2], payload[offset + 3]]) as usize;
        if attr_len < 4 || offset + attr_len > payload.len() {
            return Err(Error::new("invalid attribute length"));
        }
        let value = &payload[offset + 4..offset + attr_len];
        apply_attr(&mut config, attr_type, value)?;
        offset += align4(attr_len);
    }
    Ok(config)
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn apply_attr(config: &mut BootstrapConfig, attr_type: u16, value: &[u8]) -> Result<()> {
    match attr_type {
        CLONE_FLAGS_ATTR => config.clone_flags = read_u32(value)?,
        NS_PATHS_ATTR => config.ns_paths = parse_ns_paths(read_str(value)?),
        UIDMAP_ATTR => config.uid_map = read_str(value)?.to_owned(),
        GIDMAP_ATTR => config.gid_map = read_str(value)?.to_owned(),
        SETGROUP_ATTR => config.setgroups_requested = read_bool(value)?,
        OOM_SCORE_ADJ_ATTR => config.oom_score_adj = read_str(value)?.to_owned(),
        ROOTLESS_EUID_ATTR => config.rootless_euid = read_bool(value)?,
        UIDMAPPATH_ATTR => config.uid_map_path = Some(read_str(value)?.to_owned()),
        GIDMAPPATH_ATTR => config.gid_map_path = Some(read_str(value)?.to_owned()),
        PREP_ROOTFS_ATTR => config.prep_rootfs = read_bool(value)?,
        MAKE_PARENT_PRIV_ATTR => config.make_parent_priv = read_bool(value)?,
        ROOTFS_PROP_ATTR => config.rootfs_prop = read_u32(value)?,
        ROOTFS_ATTR => config.rootfs = read_str(value)?.to_owned(),
        PARENT_MOUNT_ATTR => config.parent_mount = read_str(value)?.to_owned(),
        SHIFTFS_MOUNTS_ATTR => {
            config.shiftfs_mounts = read_str(value)?
                .split(',')
                .filter(|v| !v.is_empty())
                .map(|v| v.to_owned())
                .collect()
        }
        other => return Err(Error::new(format!("unknown attribute type {other}"))),
    }
    Ok(())
}

fn parse_ns_paths(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter(|v| !v.is_empty())
        .filter_map(|entry| entry.split_once(':'))
        .map(|(kind, path)| (kind.to_owned(), path.to_owned()))
        .collect()
}

fn read_u32(value: &[u8]) -> Result<u32> {
    if value.len() < 4 {
        return Err(Error::new("attribute too short for u32"));
    }
    Ok(u32::from_ne_bytes([value[0], value[1], value[2], value[3]]))
}

fn read_bool(value: &[u8]) -> Result<bool> {
    value
        .first()
        .map(|v| *v != 0)
        .ok_or_else(|| Error::new("attribute too short for bool"))
}

fn read_str(value: &[u8]) -> Result<&str> {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    std::str::from_utf8(&value[..end]).context("attribute is not valid utf-8")
}
