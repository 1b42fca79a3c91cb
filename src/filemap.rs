// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read-only memory mappings of served files.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::{ptr, slice};

/// A private, read-only mapping of a whole file.
///
/// The mapping lives for at most one request/response cycle: it is created
/// when a target resolves to a non-empty file and dropped as soon as the
/// response has been written (or abandoned).
pub struct FileMap {
    addr: *mut libc::c_void,
    len: usize,
}

impl FileMap {
    /// Maps `path` read-only. The file must be non-empty; a zero-length
    /// mapping is rejected by the kernel.
    pub fn map(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        // SAFETY: length is the current file size and the descriptor is open
        // for reading; MAP_FAILED is checked before the pointer is kept.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // The descriptor can close now; the mapping keeps the pages alive.
        Ok(Self { addr, len })
    }

    /// Length of the mapped file in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing is mapped. Never the case for a live `FileMap`.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region [addr, addr + len) stays mapped and readable for
        // the lifetime of self.
        unsafe { slice::from_raw_parts(self.addr.cast::<u8>(), self.len) }
    }
}

impl Drop for FileMap {
    fn drop(&mut self) {
        // SAFETY: addr/len describe exactly the region returned by mmap.
        unsafe {
            libc::munmap(self.addr, self.len);
        }
    }
}

// SAFETY: the mapping is private and never written through; moving it to
// another thread is sound.
unsafe impl Send for FileMap {}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::FileMap;

    #[test]
    fn maps_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.html");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"<html><body>hi</body></html>").unwrap();
        drop(file);

        let map = FileMap::map(&path).unwrap();
        assert_eq!(b"<html><body>hi</body></html>" as &[u8], map.as_slice());
        assert_eq!(28, map.len());
    }

    #[test]
    fn refuses_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::File::create(&path).unwrap();

        assert!(FileMap::map(&path).is_err());
    }
}
