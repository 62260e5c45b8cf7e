//! Platforms without extent or dedup support.

use std::path::Path;

use crate::error::{Error, Result};
use crate::extents::Extent;

pub fn file_extents(_path: &Path) -> Result<Vec<Extent>> {
    Err(Error::Unsupported)
}

pub fn deduplicate_files(_src: &Path, _dest: &Path) -> Result<u64> {
    Err(Error::Unsupported)
}
