//! Windows backend: pagefile-backed named file mappings.
//!
//! Objects live in the `Local\` namespace and disappear when the last view
//! is unmapped, so `unlink` has nothing to do.

use std::io;
use std::ops::{Deref, DerefMut};
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, ERROR_FILE_NOT_FOUND, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
    FILE_MAP_ALL_ACCESS, FILE_MAP_READ, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use crate::error::{IndexHelperError, Result};

/// A mapped view; unmapped on drop.
pub struct View {
    addr: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
}

// The view is plain process memory owned by this value.
unsafe impl Send for View {}

impl Deref for View {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.Value as *const u8, self.len) }
    }
}

impl DerefMut for View {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.Value as *mut u8, self.len) }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(self.addr);
        }
    }
}

pub type MapMut = View;
pub type MapRo = View;

fn wide_path(name: &str) -> Vec<u16> {
    format!("Local\\{}", name)
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect()
}

pub fn page_size() -> usize {
    let mut info: SYSTEM_INFO = unsafe { std::mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    info.dwPageSize as usize
}

pub fn create(name: &str, len: usize, _mode: u32) -> Result<MapMut> {
    let path = wide_path(name);
    let size = len as u64;
    let handle = unsafe {
        CreateFileMappingW(
            INVALID_HANDLE_VALUE,
            ptr::null(),
            PAGE_READWRITE,
            (size >> 32) as u32,
            size as u32,
            path.as_ptr(),
        )
    };
    if handle == 0 {
        return Err(io::Error::last_os_error().into());
    }
    if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
        unsafe { CloseHandle(handle) };
        return Err(IndexHelperError::SegmentExists(name.to_string()));
    }

    let addr = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, len) };
    let err = io::Error::last_os_error();
    unsafe { CloseHandle(handle) };
    if addr.Value.is_null() {
        return Err(err.into());
    }
    Ok(View { addr, len })
}

pub fn open_readonly(name: &str) -> Result<MapRo> {
    let path = wide_path(name);
    let handle = unsafe { OpenFileMappingW(FILE_MAP_READ, 0, path.as_ptr()) };
    if handle == 0 {
        if unsafe { GetLastError() } == ERROR_FILE_NOT_FOUND {
            return Err(IndexHelperError::SegmentNotFound(name.to_string()));
        }
        return Err(io::Error::last_os_error().into());
    }

    let addr = unsafe { MapViewOfFile(handle, FILE_MAP_READ, 0, 0, 0) };
    let err = io::Error::last_os_error();
    unsafe { CloseHandle(handle) };
    if addr.Value.is_null() {
        return Err(err.into());
    }

    let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
    let written = unsafe {
        VirtualQuery(
            addr.Value,
            &mut info,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        let err = io::Error::last_os_error();
        unsafe { UnmapViewOfFile(addr) };
        return Err(err.into());
    }
    Ok(View {
        addr,
        len: info.RegionSize,
    })
}

pub fn unlink(_name: &str) -> Result<()> {
    Ok(())
}
