//! Shared test fixtures, grounded in the teacher's `tests/common.rs`
//! (`TempDir`, `rand_string`): unique scratch directories under
//! `CARGO_TARGET_TMPDIR` so concurrent test runs never collide.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rand::distributions::{Alphanumeric, DistString as _};

pub struct TempDir(PathBuf);

impl TempDir {
    #[allow(unused)]
    pub fn new() -> std::io::Result<Self> {
        let tmpdir = Path::new(env!("CARGO_TARGET_TMPDIR"));
        let path = loop {
            let path = tmpdir.join(format!("nsboot-test-{}", rand_string(32)));
            match std::fs::metadata(&path) {
                Ok(_) => continue,
                Err(v) if v.kind() == ErrorKind::NotFound => break path,
                Err(v) => return Err(v),
            }
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    #[allow(unused)]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.0.join(path)
    }

    #[allow(unused)]
    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

#[allow(unused)]
pub fn rand_string(len: usize) -> String {
    Alphanumeric.sample_string(&mut rand::thread_rng(), len)
}

/// Builds a minimal in-memory tar archive (a single regular file) and
/// unpacks it into `dir`, standing in for the rootfs content a real
/// manager would have already populated before invoking the executor.
#[allow(unused)]
pub fn unpack_fixture_rootfs(dir: &Path) -> std::io::Result<()> {
    let mut builder = tar::Builder::new(Vec::new());
    let data = b"#!/bin/sh\necho hello from the fixture rootfs\n";
    let mut header = tar::Header::new_gnu();
    header.set_path("bin/true.sh")?;
    header.set_size(data.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append(&header, &data[..])?;
    let bytes = builder.into_inner()?;
    tar::Archive::new(std::io::Cursor::new(bytes)).unpack(dir)
}
