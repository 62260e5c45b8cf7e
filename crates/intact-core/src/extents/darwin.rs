//! Partial extent support via `F_LOG2PHYS_EXT`; the same-extents dedup op
//! does not exist on this platform.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{Error, Result};
use crate::extents::Extent;

/// Largest contiguous range requested per fcntl call.
const MAX_REQUEST: i64 = 100 * 1024 * 1024;

#[repr(C)]
struct Log2Phys {
    l2p_flags: u32,
    /// In: bytes to query; out: contiguous bytes allocated at the position.
    l2p_contigbytes: i64,
    /// In: offset into the file; out: offset into the device.
    l2p_devoffset: i64,
}

pub fn file_extents(path: &Path) -> Result<Vec<Extent>> {
    let file = File::open(path)?;
    let size = file.metadata()?.len() as i64;

    let mut all = Vec::new();
    let mut start = 0i64;
    while start < size {
        let mut l2p = Log2Phys {
            l2p_flags: 0,
            l2p_contigbytes: MAX_REQUEST,
            l2p_devoffset: start,
        };
        let rc = unsafe {
            libc::fcntl(
                file.as_raw_fd(),
                libc::F_LOG2PHYS_EXT,
                &mut l2p as *mut Log2Phys,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::ENOTTY || code == libc::EINVAL => {
                    Err(Error::Unsupported)
                }
                _ => Err(Error::Io(err)),
            };
        }
        all.push(Extent {
            logical: start as u64,
            physical: l2p.l2p_devoffset as u64,
            length: l2p.l2p_contigbytes as u64,
        });
        start += l2p.l2p_contigbytes;
    }
    Ok(all)
}

pub fn deduplicate_files(_src: &Path, _dest: &Path) -> Result<u64> {
    Err(Error::Unsupported)
}
