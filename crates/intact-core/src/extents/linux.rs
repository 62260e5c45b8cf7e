//! FIEMAP extent enumeration and FIDEDUPERANGE same-extents dedup.
//!
//! https://www.kernel.org/doc/html/latest/filesystems/fiemap.html
//! https://www.man7.org/linux/man-pages/man2/ioctl_fideduperange.2.html

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::{Error, Result};
use crate::extents::{find_at, Extent};

const FS_IOC_FIEMAP: libc::c_ulong = 0xc020660b;
const FIEMAP_FLAG_SYNC: u32 = 0x0001;
const FIEMAP_EXTENT_LAST: u32 = 0x0001;
const EXTENT_BATCH: usize = 50;

const FIDEDUPERANGE: libc::c_ulong = 0xc0189436;
const FILE_DEDUPE_RANGE_DIFFERS: i32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapRequest {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
    fm_extents: [FiemapExtent; EXTENT_BATCH],
}

fn map_errno(err: io::Error) -> Error {
    match err.raw_os_error() {
        Some(code) if code == libc::EOPNOTSUPP || code == libc::ENOTTY => Error::Unsupported,
        _ => Error::Io(err),
    }
}

/// One FIEMAP call covering `[start, start+length)`; returns the mapped
/// extents and whether the LAST flag was seen.
fn ioctl_fiemap(file: &File, start: u64, length: u64) -> Result<(Vec<Extent>, bool)> {
    if length == 0 {
        return Ok((Vec::new(), true));
    }

    let mut req: FiemapRequest = unsafe { std::mem::zeroed() };
    req.fm_start = start;
    req.fm_length = length;
    req.fm_flags = FIEMAP_FLAG_SYNC;
    req.fm_extent_count = EXTENT_BATCH as u32;

    let rc = unsafe { libc::ioctl(file.as_raw_fd(), FS_IOC_FIEMAP, &mut req as *mut FiemapRequest) };
    if rc != 0 {
        return Err(map_errno(io::Error::last_os_error()));
    }

    let mapped = req.fm_mapped_extents as usize;
    let mut extents = Vec::with_capacity(mapped);
    let mut done = mapped == 0;
    let mut last_offset = start;
    for raw in &req.fm_extents[..mapped] {
        if raw.fe_logical < last_offset {
            return Err(Error::Io(io::Error::other(format!(
                "extent map out of order at offset {:#x}",
                raw.fe_logical
            ))));
        }
        last_offset = raw.fe_logical;
        extents.push(Extent {
            logical: raw.fe_logical,
            physical: raw.fe_physical,
            length: raw.fe_length,
        });
        done = raw.fe_flags & FIEMAP_EXTENT_LAST != 0;
    }

    Ok((extents, done))
}

fn file_extents_fd(file: &File) -> Result<(Vec<Extent>, u64)> {
    let size = file.metadata()?.len();
    let mut all = Vec::new();
    let mut start = 0u64;
    loop {
        let (part, done) = ioctl_fiemap(file, start, size - start)?;
        let empty = part.is_empty();
        all.extend(part);
        if done {
            return Ok((all, size));
        }
        if empty {
            return Err(Error::Unsupported);
        }
        let last = all.last().expect("non-empty batch");
        start = last.logical + last.length;
    }
}

/// Enumerate the allocation of `path`, syncing the file first.
pub fn file_extents(path: &Path) -> Result<Vec<Extent>> {
    let file = File::open(path)?;
    let (extents, _) = file_extents_fd(&file)?;
    Ok(extents)
}

#[repr(C)]
struct FileDedupeRangeInfo {
    dest_fd: i64,
    dest_offset: u64,
    bytes_deduped: u64,
    status: i32,
    reserved: u32,
}

#[repr(C)]
struct FileDedupeRange {
    src_offset: u64,
    src_length: u64,
    dest_count: u16,
    reserved1: u16,
    reserved2: u32,
    info: [FileDedupeRangeInfo; 1],
}

/// Ask the kernel to share `dest`'s extents with `src`. Walks the file by
/// whatever `bytes_deduped` each call reports, skipping ranges whose
/// extents already match. Returns the bytes reclaimed.
pub fn deduplicate_files(src: &Path, dest: &Path) -> Result<u64> {
    let f1 = File::open(src)?;
    // the destination fd must be writable
    let f2 = OpenOptions::new().read(true).write(true).open(dest)?;

    let (src_extents, size) = file_extents_fd(&f1)?;

    let mut reclaimed = 0u64;
    let mut offset = 0u64;
    while offset < size {
        let (dest_extents, _) = file_extents_fd(&f2)?;

        let mut dlen = size - offset;
        if let Some(e1) = find_at(&src_extents, offset) {
            dlen = dlen.min(e1.length);
            if let Some(e2) = find_at(&dest_extents, offset) {
                if e1.same_range(e2) {
                    offset += e1.length;
                    continue;
                }
                if e2.length < e1.length {
                    dlen = dlen.min(e2.length);
                }
            }
        }

        let mut req: FileDedupeRange = unsafe { std::mem::zeroed() };
        req.src_offset = offset;
        req.src_length = dlen;
        req.dest_count = 1;
        req.info[0].dest_fd = f2.as_raw_fd() as i64;
        req.info[0].dest_offset = offset;

        let rc =
            unsafe { libc::ioctl(f1.as_raw_fd(), FIDEDUPERANGE, &mut req as *mut FileDedupeRange) };
        if rc != 0 {
            return Err(map_errno(io::Error::last_os_error()));
        }

        let status = req.info[0].status;
        if status < 0 {
            let errno = -status;
            if errno == libc::EOPNOTSUPP {
                return Err(Error::Unsupported);
            }
            if errno == libc::EINVAL {
                return Err(Error::Io(io::Error::other(
                    "deduplication rejected the range (EINVAL)",
                )));
            }
            return Err(Error::Io(io::Error::from_raw_os_error(errno)));
        }
        if status == FILE_DEDUPE_RANGE_DIFFERS {
            return Err(Error::Io(io::Error::other(format!(
                "content differs at offset {offset:#x} (len {dlen:#x})"
            ))));
        }

        let done = req.info[0].bytes_deduped;
        reclaimed += done;
        if offset + done == size {
            break;
        } else if offset + done < size {
            offset += done;
        } else {
            return Err(Error::Io(io::Error::other(format!(
                "unexpected deduped byte count at offset {offset:#x}"
            ))));
        }
    }

    Ok(reclaimed)
}
