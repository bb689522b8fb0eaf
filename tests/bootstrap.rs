//! End-to-end exercise of the trivial bootstrap scenario: no namespaces
//! requested, no rootfs preparation, nothing to join. Requires root (the
//! init stage still calls `setuid(0)`/`setgid(0)` even with no user
//! namespace involved) and a real Linux kernel with `clone3(2)` support,
//! matching the privilege requirements of this crate's domain rather
//! than something a sandboxed test runner can satisfy unconditionally.
//!
//! `nsboot::nsexec()` terminates the calling process outright for two of
//! its three stages, so this test isolates the call inside a disposable
//! forked process rather than running it on the test harness's own
//! thread. `fork(2)` in a multi-threaded process only guarantees the
//! calling thread survives into the child, so this test needs to run
//! with a single test thread (`--test-threads=1`).

use std::io::{BufRead, BufReader, Write};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

const INIT_MSG: u16 = 62000;
const CLONE_FLAGS_ATTR: u16 = 27281;

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    let attr_len = (4 + value.len()) as u16;
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(&attr_len.to_ne_bytes());
    buf.extend_from_slice(value);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn minimal_message() -> Vec<u8> {
    let mut attrs = Vec::new();
    push_attr(&mut attrs, CLONE_FLAGS_ATTR, &0u32.to_ne_bytes());
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
fn trivial_bootstrap_reports_pid_and_every_stage_exits_cleanly() {
    let (manager_side, executor_side) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::empty(),
    )
    .unwrap();
    let mut manager_file = std::fs::File::from(manager_side);
    manager_file.write_all(&minimal_message()).unwrap();

    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
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
