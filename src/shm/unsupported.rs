//! Fallback for targets without named shared memory.

use crate::error::{IndexHelperError, Result};

pub type MapMut = Vec<u8>;
pub type MapRo = Vec<u8>;

pub fn page_size() -> usize {
    4096
}

pub fn create(_name: &str, _len: usize, _mode: u32) -> Result<MapMut> {
    Err(IndexHelperError::Unsupported)
}

pub fn open_readonly(_name: &str) -> Result<MapRo> {
    Err(IndexHelperError::Unsupported)
}

pub fn unlink(_name: &str) -> Result<()> {
    Err(IndexHelperError::Unsupported)
}
