// SPDX-License-Identifier: MIT
//
// Shared-memory mailbox: a fixed binary layout mmap'd from a file under
// /dev/shm, partitioned into slot 0 (globals, read-only after init), one
// slot per client, and a final slot for the broker itself. Binary-compatible
// with the ivshmsg.ko guest kernel module, so field order and width here are
// load-bearing, not stylistic.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::ptr;
use std::thread::sleep;
use std::time::{Duration, Instant};

use crate::error::{FabricError, Result};

pub const SLOT_SIZE: u64 = 512;
pub const BUF_OFFSET: u64 = 128;
pub const MAX_BUFLEN: usize = (SLOT_SIZE - BUF_OFFSET) as usize;
const STR_SIZE: usize = 32;

const FILL_TIMEOUT: Duration = Duration::from_millis(1050);
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mirrors `IVSHMSG_MailGlobals`: written once at broker startup, read-only
/// to every peer afterward.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MailGlobalsRaw {
    slotsize: u64,
    buf_offset: u64,
    n_clients: u64,
    n_events: u64,
    server_id: u64,
}

/// Mirrors `IVSHMSG_MailSlot`. 512 bytes exactly: 128 bytes of metadata,
/// then 384 bytes of message buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct MailSlotRaw {
    nodename: [u8; STR_SIZE],
    cclass: [u8; STR_SIZE],
    buflen: u64,
    peer_id: u64,
    last_responder: u64,
    peer_sid: u64,
    peer_cid: u64,
    _reserved: [u64; 3],
    buf: [u8; MAX_BUFLEN],
}

const _: () = assert!(std::mem::size_of::<MailSlotRaw>() == SLOT_SIZE as usize);

fn copy_str(dst: &mut [u8; STR_SIZE], s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() >= STR_SIZE {
        return Err(FabricError::Config(format!("\"{s}\" too big for a 32-byte field")));
    }
    dst.fill(0);
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

fn str_at(src: &[u8; STR_SIZE]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(STR_SIZE);
    String::from_utf8_lossy(&src[..end]).into_owned()
}

/// A mmap'd view of the mailbox file, shared with every admitted peer
/// process. Field access goes through raw pointer arithmetic onto the
/// mapped bytes rather than a safe Rust slice, since the layout must match
/// what a QEMU guest's kernel module reads directly.
pub struct MailboxRegion {
    base: *mut u8,
    map_len: usize,
    fd: RawFd,
    n_clients: u64,
    n_events: u64,
    server_id: u64,
}

// The region is shared across processes by construction; within this
// process access is confined to one reactor thread, matching the
// single-writer-per-slot discipline the wire protocol already guarantees.
unsafe impl Send for MailboxRegion {}

impl MailboxRegion {
    fn file_size(n_events: u64) -> u64 {
        let needed = SLOT_SIZE * n_events;
        needed.next_power_of_two()
    }

    /// Broker-side: create or reopen the backing file, zero it, and lay
    /// down the globals and every slot's `peer_id` sentinel.
    pub fn create(path: &Path, n_clients: u64, smart: bool) -> Result<Self> {
        let n_events = n_clients + 2;
        let server_id = n_clients + 1;
        let filesize = Self::file_size(n_events);

        let fd = Self::open_or_create_file(path, filesize)?;
        try_chown_to_libvirt_group(fd);

        let base = Self::map(fd, filesize as usize)?;

        unsafe {
            ptr::write_bytes(base, 0, filesize as usize);

            let globals = base as *mut MailGlobalsRaw;
            (*globals) = MailGlobalsRaw {
                slotsize: SLOT_SIZE,
                buf_offset: BUF_OFFSET,
                n_clients,
                n_events,
                server_id,
            };
        }

        let region = Self {
            base,
            map_len: filesize as usize,
            fd,
            n_clients,
            n_events,
            server_id,
        };

        for slot in 1..n_events {
            region.slot_mut(slot).peer_id = slot;
        }

        let name = if smart { "Z-switch" } else { "Z-server" };
        copy_str(&mut region.slot_mut(server_id).nodename, name)?;
        copy_str(&mut region.slot_mut(server_id).cclass, "FabricSwitch")?;

        Ok(region)
    }

    /// Peer-side: given an FD received over the admission socket, mmap it,
    /// read the globals slot 0 wrote, and clear our own slot.
    pub fn from_fd(fd: RawFd, own_id: u64) -> Result<Self> {
        let filesize = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut st) != 0 {
                return Err(FabricError::Io(std::io::Error::last_os_error()));
            }
            st.st_size as u64
        };

        let base = Self::map(fd, filesize as usize)?;
        let globals = unsafe { *(base as *const MailGlobalsRaw) };

        let region = Self {
            base,
            map_len: filesize as usize,
            fd,
            n_clients: globals.n_clients,
            n_events: globals.n_events,
            server_id: globals.server_id,
        };
        region.clear(own_id);
        Ok(region)
    }

    fn open_or_create_file(path: &Path, filesize: u64) -> Result<RawFd> {
        let exists = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o666)
            .open(path)?;
        let fd = file.as_raw_fd();

        if !exists {
            let ret = unsafe { libc::posix_fallocate(fd, 0, filesize as libc::off_t) };
            if ret != 0 {
                return Err(FabricError::Io(std::io::Error::from_raw_os_error(ret)));
            }
        } else {
            let meta = file.metadata()?;
            if meta.len() < filesize {
                return Err(FabricError::Config(format!(
                    "existing mailbox {} is {} bytes, need at least {}",
                    path.display(),
                    meta.len(),
                    filesize
                )));
            }
        }

        // Leak the fd out of `File` — the mapping keeps the underlying
        // object alive, and we manage lifetime ourselves from here on.
        std::mem::forget(file);
        Ok(fd)
    }

    fn map(fd: RawFd, len: usize) -> Result<*mut u8> {
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(FabricError::Io(std::io::Error::last_os_error()));
        }
        Ok(mem as *mut u8)
    }

    pub fn n_clients(&self) -> u64 {
        self.n_clients
    }

    pub fn n_events(&self) -> u64 {
        self.n_events
    }

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    /// The fd this region is mapped from, for handing out over SCM_RIGHTS.
    pub fn backing_fd(&self) -> RawFd {
        self.fd
    }

    fn slot_ptr(&self, id: u64) -> *mut MailSlotRaw {
        debug_assert!(id >= 1 && id <= self.server_id);
        unsafe { self.base.add((SLOT_SIZE * id) as usize) as *mut MailSlotRaw }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot_mut(&self, id: u64) -> &mut MailSlotRaw {
        unsafe { &mut *self.slot_ptr(id) }
    }

    fn slot(&self, id: u64) -> &MailSlotRaw {
        unsafe { &*self.slot_ptr(id) }
    }

    /// Post a message to `sender_id`'s own slot. Waits up to ~1.05s for a
    /// previous message to drain before stomping it anyway.
    pub fn fill(&self, sender_id: u64, bytes: &[u8]) -> Result<bool> {
        if bytes.len() >= MAX_BUFLEN {
            return Err(FabricError::MalformedFrame);
        }
        let slot = self.slot_mut(sender_id);

        let deadline = Instant::now() + FILL_TIMEOUT;
        let mut in_time = true;
        while slot.buflen != 0 {
            if Instant::now() >= deadline {
                in_time = false;
                break;
            }
            sleep(FILL_POLL_INTERVAL);
        }

        slot.buf[..bytes.len()].copy_from_slice(bytes);
        slot.buflen = bytes.len() as u64;
        Ok(in_time)
    }

    /// Read and drain `sender_id`'s slot. The zeroed `buflen` is the ACK.
    pub fn retrieve(&self, sender_id: u64) -> Vec<u8> {
        let slot = self.slot_mut(sender_id);
        let buflen = slot.buflen as usize;
        let buf = slot.buf[..buflen].to_vec();
        slot.buflen = 0;
        buf
    }

    pub fn clear(&self, id: u64) {
        let slot = self.slot_mut(id);
        slot.nodename = [0u8; STR_SIZE];
        slot.cclass = [0u8; STR_SIZE];
        slot.peer_id = id;
    }

    pub fn active_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = (1..=self.server_id)
            .filter(|&id| self.slot(id).nodename[0] != 0)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn nodename(&self, id: u64) -> String {
        str_at(&self.slot(id).nodename)
    }

    pub fn set_nodename(&self, id: u64, name: &str) -> Result<()> {
        copy_str(&mut self.slot_mut(id).nodename, name)
    }

    pub fn cclass(&self, id: u64) -> String {
        str_at(&self.slot(id).cclass)
    }

    pub fn set_cclass(&self, id: u64, cclass: &str) -> Result<()> {
        copy_str(&mut self.slot_mut(id).cclass, cclass)
    }

    pub fn peer_sid(&self, id: u64) -> u64 {
        self.slot(id).peer_sid
    }

    pub fn set_peer_sid(&self, id: u64, v: u64) {
        self.slot_mut(id).peer_sid = v;
    }

    pub fn peer_cid(&self, id: u64) -> u64 {
        self.slot(id).peer_cid
    }

    pub fn set_peer_cid(&self, id: u64, v: u64) {
        self.slot_mut(id).peer_cid = v;
    }

    pub fn last_responder(&self, id: u64) -> u64 {
        self.slot(id).last_responder
    }

    pub fn set_last_responder(&self, id: u64, v: u64) {
        self.slot_mut(id).last_responder = v;
    }

}

impl Drop for MailboxRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

fn try_chown_to_libvirt_group(fd: RawFd) {
    for name in ["libvirt-qemu", "libvirt", "libvirtd"] {
        if let Ok(cname) = CString::new(name) {
            let gid = unsafe {
                let grp = libc::getgrnam(cname.as_ptr());
                if grp.is_null() {
                    continue;
                }
                (*grp).gr_gid
            };
            let ret = unsafe { libc::fchown(fd, u32::MAX, gid) };
            if ret == 0 {
                log::debug!("mailbox group set to {name}");
            } else {
                log::warn!("could not chown mailbox to group {name}: {}", std::io::Error::last_os_error());
            }
            return;
        }
    }
    log::debug!("no libvirt group found, leaving mailbox group unchanged");
}
