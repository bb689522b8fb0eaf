//! The two sync socketpairs that drive the PARENT/CHILD/INIT handshake
//! (SPEC_FULL.md §4.6). Each pair is used half-duplex: every stage closes
//! the end it doesn't own as soon as it starts running.

use std::fs::File;
use std::io::{Read, Write};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::error::{Context, Error, Result};
use crate::syscall::Pid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncMessage {
    UsermapPls,
    UsermapAck,
    RecvPidPls,
    RecvPidAck,
    Grandchild,
    ChildReady,
}

impl SyncMessage {
    fn to_byte(self) -> u8 {
        match self {
            SyncMessage::UsermapPls => 1,
            SyncMessage::UsermapAck => 2,
            SyncMessage::RecvPidPls => 3,
            SyncMessage::RecvPidAck => 4,
            SyncMessage::Grandchild => 5,
            SyncMessage::ChildReady => 6,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => SyncMessage::UsermapPls,
            2 => SyncMessage::UsermapAck,
            3 => SyncMessage::RecvPidPls,
            4 => SyncMessage::RecvPidAck,
            5 => SyncMessage::Grandchild,
            6 => SyncMessage::ChildReady,
            other => return Err(Error::new(format!("unrecognized sync tag {other}"))),
        })
    }
}

/// One end of a sync socketpair, restricted to whole-message reads/writes.
pub(crate) struct SyncChannel(File);

impl SyncChannel {
    pub fn send(&mut self, msg: SyncMessage) -> Result<()> {
        self.0
            .write_all(&[msg.to_byte()])
            .context("writing sync message")
    }

    pub fn recv(&mut self) -> Result<SyncMessage> {
        let mut buf = [0u8; 1];
        self.0.read_exact(&mut buf).context("reading sync message")?;
        SyncMessage::from_byte(buf[0])
    }

    /// Reads `msg` and fails unless it matches exactly.
    pub fn expect(&mut self, msg: SyncMessage) -> Result<()> {
        let got = self.recv()?;
        if got != msg {
            return Err(Error::new(format!("expected {msg:?} sync message, got {got:?}")));
        }
        Ok(())
    }

    pub fn send_pid(&mut self, pid: Pid) -> Result<()> {
        self.0
            .write_all(&pid.as_raw().to_ne_bytes())
            .context("writing sync pid")
    }

    pub fn recv_pid(&mut self) -> Result<Pid> {
        let mut buf = [0u8; 4];
        self.0.read_exact(&mut buf).context("reading sync pid")?;
        Ok(Pid::from_raw(nix::libc::pid_t::from_ne_bytes(buf)))
    }
}

/// A freshly allocated socketpair before either stage has claimed an end.
pub(crate) struct SyncPair {
    a: File,
    b: File,
}

impl SyncPair {
    pub fn new() -> Result<Self> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .context("creating sync socketpair")?;
        Ok(Self {
            a: File::from(a),
            b: File::from(b),
        })
    }

    /// Keep end `a`, drop end `b` — used by the side that owns end 1 in
    /// SPEC_FULL.md's numbering (the parent side of each pair).
    pub fn keep_a(self) -> SyncChannel {
        drop(self.b);
        SyncChannel(self.a)
    }

    /// Keep end `b`, drop end `a` — the child side of each pair.
    pub fn keep_b(self) -> SyncChannel {
        drop(self.a);
        SyncChannel(self.b)
    }
}
