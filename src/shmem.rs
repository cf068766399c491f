//! Named, file-backed shared memory: create-or-open a region by name,
//! remember it so it can be unmapped and unlinked later, and hand back a
//! typed view onto the cross-process state blob.
//!
//! Mirrors `pmem.c`: `shm_open` + `ftruncate` + `mmap`, tracked in a
//! process-local table keyed by name so `free` can find the mapping again.

use std::ffi::CString;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Mutex;

use crate::error::ShmemError;

static PMEM_TABLE: Mutex<Vec<PmemEntry>> = Mutex::new(Vec::new());

struct PmemEntry {
    name: String,
    addr: *mut libc::c_void,
    size: usize,
}

// SAFETY: the raw pointer is a shared-memory mapping; all access to the
// pointee itself still goes through `PmemState`'s own synchronization
// discipline (the mailbox worker serializes access per-VF).
unsafe impl Send for PmemEntry {}

/// Device lifecycle state persisted in the shared blob.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OdmDevState {
    Init = 0,
    InitDone = 1,
    Running = 2,
}

pub const ODM_MAX_VFS: usize = 16;

/// Cross-process state blob, persistent across process restarts.
///
/// `#[repr(C)]` so the byte layout is stable across the lifetime of the
/// mapping regardless of which process built the binary.
#[repr(C)]
pub struct PmemState {
    pub dev_state: u32,
    pub maxq_per_vf: i32,
    pub vfs_in_use: i32,
    pub setup_done: [bool; ODM_MAX_VFS],
}

impl PmemState {
    pub fn dev_state(&self) -> OdmDevState {
        match self.dev_state {
            0 => OdmDevState::Init,
            1 => OdmDevState::InitDone,
            _ => OdmDevState::Running,
        }
    }

    pub fn set_dev_state(&mut self, state: OdmDevState) {
        self.dev_state = state as u32;
    }
}

/// A mapped shared-memory region holding a `PmemState`.
pub struct PmemHandle {
    name: String,
    ptr: *mut PmemState,
}

// SAFETY: see `PmemEntry`.
unsafe impl Send for PmemHandle {}

impl PmemHandle {
    pub fn as_ref(&self) -> &PmemState {
        unsafe { &*self.ptr }
    }

    pub fn as_mut(&mut self) -> &mut PmemState {
        unsafe { &mut *self.ptr }
    }
}

/// Creates or opens `name` as a `size`-byte shared memory region, mapping
/// it read/write/shared and remembering the mapping so `pmem_free` can
/// unmap and unlink it later.
pub fn pmem_alloc(name: &str, size: usize) -> Result<*mut libc::c_void, ShmemError> {
    let cname = CString::new(name).expect("shm name must not contain NUL");

    let fd: RawFd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o666) };
    if fd < 0 {
        return Err(ShmemError::Open(name.to_string(), std::io::Error::last_os_error()));
    }

    let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(ShmemError::Truncate(name.to_string(), err));
    }

    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    // The fd is no longer needed once mapped; the mapping keeps the
    // underlying object alive.
    unsafe { libc::close(fd) };

    if addr == libc::MAP_FAILED {
        return Err(ShmemError::Mmap(name.to_string(), std::io::Error::last_os_error()));
    }

    PMEM_TABLE.lock().unwrap().push(PmemEntry {
        name: name.to_string(),
        addr,
        size,
    });

    log::debug!("allocated shared memory {}", name);
    Ok(addr)
}

/// Opens (or creates) the cross-process state blob by name, zero-initializing
/// freshly created regions.
pub fn pmem_alloc_state(name: &str) -> Result<PmemHandle, ShmemError> {
    let was_new = !shm_exists(name);
    let addr = pmem_alloc(name, mem::size_of::<PmemState>())?;
    let ptr = addr as *mut PmemState;
    if was_new {
        unsafe { ptr::write_bytes(ptr, 0, 1) };
    }
    Ok(PmemHandle {
        name: name.to_string(),
        ptr,
    })
}

fn shm_exists(name: &str) -> bool {
    let trimmed = name.trim_start_matches('/');
    std::path::Path::new("/dev/shm").join(trimmed).exists()
}

/// Unmaps and unlinks the shared memory region previously obtained via
/// `pmem_alloc`/`pmem_alloc_state`.
pub fn pmem_free(name: &str) -> Result<(), ShmemError> {
    let mut table = PMEM_TABLE.lock().unwrap();
    let idx = table
        .iter()
        .position(|e| e.name == name)
        .ok_or_else(|| ShmemError::NotTracked(name.to_string()))?;
    let entry = table.remove(idx);

    let rc = unsafe { libc::munmap(entry.addr, entry.size) };
    if rc < 0 {
        return Err(ShmemError::Mmap(name.to_string(), std::io::Error::last_os_error()));
    }

    let cname = CString::new(name).expect("shm name must not contain NUL");
    let rc = unsafe { libc::shm_unlink(cname.as_ptr()) };
    if rc < 0 {
        return Err(ShmemError::Unlink(name.to_string(), std::io::Error::last_os_error()));
    }

    log::debug!("freed shared memory {}", name);
    Ok(())
}

pub fn pmem_free_handle(handle: PmemHandle) -> Result<(), ShmemError> {
    pmem_free(&handle.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_roundtrips() {
        let name = format!("/odm_test_{}", std::process::id());
        let mut handle = pmem_alloc_state(&name).expect("alloc");
        assert_eq!(handle.as_ref().dev_state(), OdmDevState::Init);
        handle.as_mut().set_dev_state(OdmDevState::Running);
        assert_eq!(handle.as_ref().dev_state(), OdmDevState::Running);
        pmem_free_handle(handle).expect("free");
    }
}
