use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::{Error, Result};

/// One mapped memory region holding every pool event's payload, either
/// anonymous or backed by a file that is rebuilt at each start.
pub(crate) struct Segment {
    _file: Option<File>,
    _map: MmapMut,
    ptr: *mut u8,
    len: usize,
}

// Access to disjoint slot ranges is serialized by the pool's slot mutexes.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    pub(crate) fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("segment length must be non-zero"));
        }
        let mut map = MmapOptions::new().len(len).map_anon()?;
        let ptr = map.as_mut_ptr();
        Ok(Self {
            _file: None,
            _map: map,
            ptr,
            len,
        })
    }

    pub(crate) fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidArgument("segment length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        let ptr = map.as_mut_ptr();
        Ok(Self {
            _file: Some(file),
            _map: map,
            ptr,
            len,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Base pointer of `[offset, offset + len)`.
    pub(crate) fn range_ptr(&self, offset: usize, len: usize) -> Result<*mut u8> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::InvalidArgument("range overflow"))?;
        if end > self.len {
            return Err(Error::InvalidArgument("range out of bounds"));
        }
        Ok(unsafe { self.ptr.add(offset) })
    }
}

/// Oversize buffer allocated for a single temporary event.
pub(crate) struct TempBuffer {
    map: MmapMut,
}

impl TempBuffer {
    pub(crate) fn allocate(len: usize) -> Result<Self> {
        let map = MmapOptions::new().len(len.max(1)).map_anon()?;
        Ok(Self { map })
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_segment_is_sized_and_bounded() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.seg");
        let segment = Segment::create(&path, 4096)?;
        assert_eq!(segment.len(), 4096);
        assert_eq!(std::fs::metadata(&path)?.len(), 4096);
        assert!(segment.range_ptr(4000, 96).is_ok());
        assert!(segment.range_ptr(4000, 97).is_err());
        assert!(segment.range_ptr(usize::MAX, 2).is_err());
        Ok(())
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(Segment::anonymous(0).is_err());
    }
}
