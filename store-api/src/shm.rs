//! The shared-memory arena backend.
//!
//! A POSIX shm region of fixed byte budget, created by the supervisor
//! before any actor spawns and mapped into every actor process. Allocation
//! is a bump of an atomic cursor, so `put` never blocks and minting is
//! atomic across processes; nothing is ever reclaimed, which is the trade
//! the arena makes for speed. Handles are region offsets.
//!
//! Entry layout: an id word published with release ordering after the
//! length word and payload are in place, so a reader that observes the id
//! also observes the bytes.

use std::{
    ffi::CString,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    BadRegion, Handle, ObjectStore, StoreError, StoreEvent, StoreEvents, StoreResult,
};

const MAGIC: u64 = 0x4e58_5f41_5245_4e41; // "NX_ARENA"
const HEADER_LEN: usize = 64;
const ENTRY_HEADER: usize = 16;

const MAGIC_OFF: usize = 0;
const SIZE_OFF: usize = 8;
const CURSOR_OFF: usize = 16;
const IDS_OFF: usize = 24;

/// One process's mapping of the arena region.
pub struct ShmStore {
    region: String,
    base: *mut u8,
    size: usize,
    subscribers: Vec<mpsc::Sender<StoreEvent>>,
}

// The mapping is plain memory; cross-process coordination goes through
// the atomics in the header.
unsafe impl Send for ShmStore {}

fn os_error(region: &str) -> StoreError {
    StoreError::Region {
        name: region.to_string(),
        source: std::io::Error::last_os_error(),
    }
}

impl ShmStore {
    /// Create the region with the given byte budget and map it. The
    /// region must not exist yet.
    pub fn create(region: &str, size: u64) -> StoreResult<Self> {
        if (size as usize) <= HEADER_LEN {
            return BadRegion {
                name: region,
            }
            .fail();
        }
        let store = Self::map(region, Some(size))?;
        unsafe {
            std::ptr::write_volatile(store.base.add(MAGIC_OFF) as *mut u64, MAGIC);
            std::ptr::write_volatile(store.base.add(SIZE_OFF) as *mut u64, size);
            store.cursor().store(HEADER_LEN as u64, Ordering::SeqCst);
            store.ids().store(1, Ordering::SeqCst);
        }
        debug!("created store region '{}' ({} bytes)", region, size);
        Ok(store)
    }

    /// Map an existing region created by the supervisor.
    pub fn open(region: &str) -> StoreResult<Self> {
        let store = Self::map(region, None)?;
        let magic = unsafe { std::ptr::read_volatile(store.base.add(MAGIC_OFF) as *const u64) };
        let recorded =
            unsafe { std::ptr::read_volatile(store.base.add(SIZE_OFF) as *const u64) };
        if magic != MAGIC || recorded as usize != store.size {
            return BadRegion {
                name: region,
            }
            .fail();
        }
        Ok(store)
    }

    fn map(region: &str, create_size: Option<u64>) -> StoreResult<Self> {
        let cname = match CString::new(region) {
            Ok(cname) => cname,
            Err(_) => {
                return BadRegion {
                    name: region,
                }
                .fail()
            }
        };

        let flags = match create_size {
            Some(_) => libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            None => libc::O_RDWR,
        };
        let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0o600) };
        if fd < 0 {
            return Err(os_error(region));
        }

        let size = match create_size {
            Some(size) => {
                if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                    let error = os_error(region);
                    unsafe { libc::close(fd) };
                    return Err(error);
                }
                size as usize
            }
            None => {
                let mut st: libc::stat = unsafe { std::mem::zeroed() };
                if unsafe { libc::fstat(fd, &mut st) } != 0 {
                    let error = os_error(region);
                    unsafe { libc::close(fd) };
                    return Err(error);
                }
                st.st_size as usize
            }
        };

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            return Err(os_error(region));
        }

        Ok(Self {
            region: region.to_string(),
            base: base as *mut u8,
            size,
            subscribers: Vec::new(),
        })
    }

    fn cursor(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(CURSOR_OFF) as *const AtomicU64) }
    }

    fn ids(&self) -> &AtomicU64 {
        unsafe { &*(self.base.add(IDS_OFF) as *const AtomicU64) }
    }

    fn publish(&mut self, event: StoreEvent) {
        self.subscribers
            .retain(|subscriber| subscriber.try_send(event.clone()).is_ok());
    }
}

impl Drop for ShmStore {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// Remove the region name from the system. Existing mappings stay valid;
/// the supervisor calls this at shutdown.
pub fn unlink_region(region: &str) -> std::io::Result<()> {
    let cname = CString::new(region)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for ShmStore {
    async fn put(&mut self, bytes: &[u8], name: Option<&str>) -> StoreResult<Handle> {
        let needed = (ENTRY_HEADER + bytes.len() + 7) & !7;
        let start = self.cursor().fetch_add(needed as u64, Ordering::SeqCst) as usize;
        if start.saturating_add(needed) > self.size {
            // the cursor stays past the end; every later put fails too
            return crate::StoreFull {
                needed: bytes.len() as u64,
                available: self.size.saturating_sub(start) as u64,
            }
            .fail();
        }
        let id = self.ids().fetch_add(1, Ordering::SeqCst);
        unsafe {
            let entry = self.base.add(start);
            std::ptr::write_volatile(entry.add(8) as *mut u64, bytes.len() as u64);
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                entry.add(ENTRY_HEADER),
                bytes.len(),
            );
            // publish last so readers that see the id see the payload
            (&*(entry as *const AtomicU64)).store(id, Ordering::Release);
        }
        self.publish(StoreEvent::Added {
            id,
            name: name.map(str::to_string),
            len: bytes.len() as u64,
        });
        Ok(Handle::new(
            id,
            start as u64,
            bytes.len() as u64,
            name.map(str::to_string),
        ))
    }

    async fn get(&mut self, handle: &Handle) -> StoreResult<Vec<u8>> {
        let loc = handle.loc() as usize;
        let len = handle.size() as usize;
        if loc < HEADER_LEN
            || loc + ENTRY_HEADER + len > self.size
            || handle.id() == 0
        {
            return crate::NotFound {
                id: handle.id(),
            }
            .fail();
        }
        unsafe {
            let entry = self.base.add(loc);
            let id = (&*(entry as *const AtomicU64)).load(Ordering::Acquire);
            let recorded = std::ptr::read_volatile(entry.add(8) as *const u64);
            if id != handle.id() || recorded as usize != len {
                return crate::NotFound {
                    id: handle.id(),
                }
                .fail();
            }
            let mut bytes = vec![0u8; len];
            std::ptr::copy_nonoverlapping(
                entry.add(ENTRY_HEADER),
                bytes.as_mut_ptr(),
                len,
            );
            Ok(bytes)
        }
    }

    async fn get_list(&mut self, handles: &[Handle]) -> StoreResult<Vec<Vec<u8>>> {
        let mut values = Vec::with_capacity(handles.len());
        for handle in handles {
            values.push(self.get(handle).await?);
        }
        Ok(values)
    }

    async fn expire(&mut self, handle: &Handle, after: Duration) -> StoreResult<()> {
        // the arena never reclaims; accepted as advisory
        debug!(
            "expire of {} after {:?} is advisory on the arena backend",
            handle, after
        );
        Ok(())
    }

    async fn free(&mut self, handle: &Handle) -> StoreResult<()> {
        debug!("free of {} is advisory on the arena backend", handle);
        Ok(())
    }

    async fn subscribe(&mut self) -> StoreResult<StoreEvents> {
        // local to this client: arena writes by other processes are not
        // observable without a side channel
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.push(tx);
        Ok(StoreEvents::new(rx))
    }
}
