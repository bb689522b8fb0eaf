//! End-to-end exercise of the "rootless, single mapping" scenario from
//! SPEC_FULL.md §8 scenario 2: a user+mount namespace, a one-line uid/gid
//! map written directly (no helper fallback), and rootfs preparation
//! (propagation + bind-to-self) against a fixture rootfs built with `tar`.
//!
//! Same process-isolation rationale as `tests/bootstrap.rs`: `nsexec`
//! terminates two of its three stages outright, so the call is made from
//! inside a disposable forked process. Requires root and `clone3(2)`.

mod common;

use std::io::{BufRead, BufReader, Write};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use common::{unpack_fixture_rootfs, TempDir};

const INIT_MSG: u16 = 62000;
const CLONE_FLAGS_ATTR: u16 = 27281;
const UIDMAP_ATTR: u16 = 27283;
const GIDMAP_ATTR: u16 = 27284;
const SETGROUP_ATTR: u16 = 27285;
const ROOTLESS_EUID_ATTR: u16 = 27287;
const PREP_ROOTFS_ATTR: u16 = 27290;
const MAKE_PARENT_PRIV_ATTR: u16 = 27291;
const ROOTFS_PROP_ATTR: u16 = 27292;
const ROOTFS_ATTR: u16 = 27293;
const PARENT_MOUNT_ATTR: u16 = 27294;

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = (4 + value.len()) as u16;
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(&attr_len.to_ne_bytes());
    buf.extend_from_slice(value);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn push_bool(buf: &mut Vec<u8>, attr_type: u16, value: bool) {
    push_attr(buf, attr_type, &[value as u8]);
}

fn build_message(rootfs: &std::path::Path, parent_mount: &std::path::Path) -> Vec<u8> {
    const CLONE_NEWUSER: u32 = nix::libc::CLONE_NEWUSER as u32;
    const CLONE_NEWNS: u32 = nix::libc::CLONE_NEWNS as u32;
    let prop_flags = (nix::mount::MsFlags::MS_PRIVATE | nix::mount::MsFlags::MS_REC).bits() as u32;

    let mut attrs = Vec::new();
    push_attr(
        &mut attrs,
        CLONE_FLAGS_ATTR,
        &(CLONE_NEWUSER | CLONE_NEWNS).to_ne_bytes(),
    );
    push_attr(&mut attrs, UIDMAP_ATTR, b"0 0 1");
    push_attr(&mut attrs, GIDMAP_ATTR, b"0 0 1");
    push_bool(&mut attrs, SETGROUP_ATTR, false);
    push_bool(&mut attrs, ROOTLESS_EUID_ATTR, true);
    push_bool(&mut attrs, PREP_ROOTFS_ATTR, true);
    push_bool(&mut attrs, MAKE_PARENT_PRIV_ATTR, true);
    push_attr(&mut attrs, ROOTFS_PROP_ATTR, &prop_flags.to_ne_bytes());
    push_attr(
        &mut attrs,
        ROOTFS_ATTR,
        rootfs.to_str().unwrap().as_bytes(),
    );
    push_attr(
        &mut attrs,
        PARENT_MOUNT_ATTR,
        parent_mount.to_str().unwrap().as_bytes(),
    );

    let mut msg = Vec::new();
    msg.extend_from_slice(&INIT_MSG.to_ne_bytes());
    msg.extend_from_slice(&(attrs.len() as u16).to_ne_bytes());
    msg.extend_from_slice(&attrs);
    msg
}

fn expect_exit_0(pid: Pid) {
    match waitpid(pid, None).unwrap() {
        WaitStatus::Exited(_, 0) => {}
        other => panic!("expected pid {pid} to exit 0, got {other:?}"),
    }
}

#[test]
fn rootless_single_mapping_with_rootfs_prep_reports_pid_and_exits_cleanly() {
    let rootfs = TempDir::new().unwrap();
    unpack_fixture_rootfs(rootfs.as_path()).unwrap();
    let parent_mount = rootfs.as_path().parent().unwrap().to_path_buf();

    let (manager_side, executor_side) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let mut manager_file = std::fs::File::from(manager_side);
    manager_file
        .write_all(&build_message(rootfs.as_path(), &parent_mount))
        .unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            // The manager is expected to have already set the caller's
            // working directory to the rootfs before invoking the
            // executor (SPEC_FULL.md §3 invariant on `prep_rootfs`).
            std::env::set_current_dir(rootfs.as_path()).unwrap();
            let executor_fd = std::os::fd::IntoRawFd::into_raw_fd(executor_side);
            unsafe {
                std::env::set_var("_LIBCONTAINER_INITPIPE", executor_fd.to_string());
                std::env::remove_var("_LIBCONTAINER_LOGPIPE");
            }
            match nsboot::nsexec() {
                Ok(()) => unsafe { nix::libc::_exit(0) },
                Err(_) => unsafe { nix::libc::_exit(1) },
            }
        }
        ForkResult::Parent { child: stage0 } => {
            drop(executor_side);
            let mut reader = BufReader::new(manager_file);
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
            let pid = parsed["pid"].as_i64().unwrap();
            let pid_first = parsed["pid_first"].as_i64().unwrap();

            expect_exit_0(stage0);
            expect_exit_0(Pid::from_raw(pid_first as i32));
            expect_exit_0(Pid::from_raw(pid as i32));
        }
    }
}
