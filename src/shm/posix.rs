//! POSIX backend: `shm_open` objects mapped with memmap2.

use memmap2::{Mmap, MmapMut};
use sha1::{Digest, Sha1};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::{FromRawFd, OwnedFd};

use crate::error::{IndexHelperError, Result};

pub type MapMut = MmapMut;
pub type MapRo = Mmap;

/// Longest object path, leading `/` included, the kernel accepts.
#[cfg(any(target_os = "macos", target_os = "ios"))]
const OBJECT_PATH_MAX: usize = 31;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const OBJECT_PATH_MAX: usize = 255;

/// Kernel object path for a segment name. Names that do not fit are replaced
/// by a digest of the whole name, so every process derives the same path.
fn object_path(name: &str, max: usize) -> String {
    let direct = format!("/{}", name);
    if direct.len() <= max {
        return direct;
    }
    let digest = hex::encode(Sha1::digest(name.as_bytes()));
    let keep = digest.len().min(max.saturating_sub(1));
    format!("/{}", &digest[..keep])
}

fn shm_path(name: &str) -> Result<CString> {
    CString::new(object_path(name, OBJECT_PATH_MAX))
        .map_err(|_| IndexHelperError::InvalidName(name.to_string()))
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
unsafe fn shm_open(path: &CString, oflag: libc::c_int, mode: u32) -> libc::c_int {
    libc::shm_open(path.as_ptr(), oflag, mode as libc::c_uint)
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
unsafe fn shm_open(path: &CString, oflag: libc::c_int, mode: u32) -> libc::c_int {
    libc::shm_open(path.as_ptr(), oflag, mode as libc::mode_t)
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

/// Exclusively create `name` with `len` bytes and map it read-write.
pub fn create(name: &str, len: usize, mode: u32) -> Result<MapMut> {
    let path = shm_path(name)?;
    let fd = unsafe { shm_open(&path, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, mode) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EEXIST) => IndexHelperError::SegmentExists(name.to_string()),
            _ => err.into(),
        });
    }
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

    let mapped = file
        .set_len(len as u64)
        .and_then(|_| unsafe { MmapMut::map_mut(&file) });
    match mapped {
        Ok(map) => Ok(map),
        Err(e) => {
            let _ = unlink(name);
            Err(e.into())
        }
    }
}

/// Open an existing `name` and map the whole object read-only.
pub fn open_readonly(name: &str) -> Result<MapRo> {
    let path = shm_path(name)?;
    let fd = unsafe { shm_open(&path, libc::O_RDONLY, 0) };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOENT) => IndexHelperError::SegmentNotFound(name.to_string()),
            _ => err.into(),
        });
    }
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });
    if file.metadata()?.len() == 0 {
        return Err(IndexHelperError::invalid_segment(name, "object has no size yet"));
    }
    let map = unsafe { Mmap::map(&file)? };
    Ok(map)
}

pub fn unlink(name: &str) -> Result<()> {
    let path = shm_path(name)?;
    if unsafe { libc::shm_unlink(path.as_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::ENOENT) => IndexHelperError::SegmentNotFound(name.to_string()),
            _ => err.into(),
        });
    }
    Ok(())
}
