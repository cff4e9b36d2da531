//! Daemon slot lock file.
//!
//! A single `.lock.daemon` file in the storage directory coordinates every
//! daemon instance on the machine. Two disjoint byte regions are used:
//!
//! - data region, bytes `[0, 4 * 65535)`: four bytes per slot holding the
//!   published port as a big-endian 32-bit integer (`<= 0` = not published);
//! - slot-lock region, the same layout starting at `i64::MAX / 2`: never read
//!   or written, used purely as lock-granularity substrate.
//!
//! Holding the exclusive byte-range lock on slot-lock bytes `i` IS owning
//! slot `i`; the OS is the single source of truth and releases the lock when
//! the process dies. The region offset is part of the on-disk contract: every
//! process sharing a storage directory must use the same value.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use self::range::{LockKind, RangeLock};

pub const DAEMON_LOCK_FILE_NAME: &str = ".lock.daemon";

/// Four bytes of port data per slot.
const SLOT_DATA_LEN: u64 = 4;

/// Slots [0, 65535); more daemons than that would run out of ports anyway.
pub const SLOT_INDEX_END: u32 = 0xFFFF;

const SLOT_LOCK_REGION_START: u64 = (i64::MAX / 2) as u64;

fn slot_lock_offset(index: u32) -> u64 {
    SLOT_LOCK_REGION_START + u64::from(index) * SLOT_DATA_LEN
}

fn slot_data_offset(index: u32) -> u64 {
    u64::from(index) * SLOT_DATA_LEN
}

/// The open lock file of a storage directory.
pub struct SlotLockFile {
    file: Arc<File>,
    path: PathBuf,
}

impl SlotLockFile {
    /// Open (creating if missing) the lock file under `storage_directory`.
    pub fn open(storage_directory: &Path) -> Result<Self, SlotLockError> {
        let path = storage_directory.join(DAEMON_LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self {
            file: Arc::new(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claim the first free slot.
    ///
    /// Takes a non-blocking exclusive lock on each slot-lock range in order;
    /// the first that succeeds is ours for the daemon's entire life. The data
    /// bytes of the slot are then locked (blocking) to cover initialization:
    /// enumerators wait on that lock until [`DaemonInstanceSlot::finish_initialization`].
    pub fn acquire_slot(&self) -> Result<DaemonInstanceSlot, SlotLockError> {
        for index in 0..SLOT_INDEX_END {
            let Some(slot_lock) = range::try_lock(
                &self.file,
                LockKind::Exclusive,
                slot_lock_offset(index),
                SLOT_DATA_LEN,
            )?
            else {
                continue;
            };
            let data_lock = range::lock(
                &self.file,
                LockKind::Exclusive,
                slot_data_offset(index),
                SLOT_DATA_LEN,
            )?;
            return Ok(DaemonInstanceSlot {
                file: Arc::clone(&self.file),
                index,
                _slot_lock: slot_lock,
                data_lock: Some(data_lock),
            });
        }
        Err(SlotLockError::SlotsExhausted)
    }
}

/// One claimed slot: index, the held slot-lock, and the published port.
///
/// Dropping the slot releases both locks, which is how other processes
/// observe the slot as free again.
pub struct DaemonInstanceSlot {
    file: Arc<File>,
    index: u32,
    _slot_lock: RangeLock,
    data_lock: Option<RangeLock>,
}

impl DaemonInstanceSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Write the listening port into the slot's data bytes.
    ///
    /// Only valid while the data lock from acquisition is still held.
    pub fn publish_port(&mut self, port: u16) -> Result<(), SlotLockError> {
        if self.data_lock.is_none() {
            return Err(SlotLockError::InitializationFinished { index: self.index });
        }
        let bytes = u32::from(port).to_be_bytes();
        self.file
            .write_all_at(&bytes, slot_data_offset(self.index))?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Release the data lock, making the published port visible to
    /// enumerators that were waiting out our initialization.
    pub fn finish_initialization(&mut self) {
        self.data_lock = None;
    }
}

/// Enumerate the ports of every running daemon using `storage_directory`.
///
/// For each slot, a non-blocking shared lock on the slot-lock bytes succeeds
/// iff no daemon holds the slot. Held slots are read under a blocking shared
/// lock of the data bytes, which waits out an in-progress initializer, so a
/// returned port always belongs to a fully started daemon.
///
/// Known race: while this enumerator briefly holds the only free slot range
/// in shared mode, a concurrently starting daemon observes no free slot.
/// Accepted; the realistic daemon count is far below the slot count.
pub fn running_daemon_ports(storage_directory: &Path) -> Result<Vec<u16>, SlotLockError> {
    let path = storage_directory.join(DAEMON_LOCK_FILE_NAME);
    let file = match File::open(&path) {
        Ok(file) => Arc::new(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(SlotLockError::Io(err)),
    };

    let mut ports = Vec::new();
    let mut index = 0u32;
    while index < SLOT_INDEX_END {
        let free = range::try_lock(
            &file,
            LockKind::Shared,
            slot_lock_offset(index),
            SLOT_DATA_LEN,
        )?;
        match free {
            Some(lock) => {
                // Free slot. Release it before probing whether any daemon at
                // all remains in the rest of the region.
                drop(lock);
                let remaining = SLOT_INDEX_END - index - 1;
                if remaining <= 1 {
                    index += 1;
                    continue;
                }
                // Probe the remainder in two halves, upper half first, so a
                // daemon starting concurrently can still claim a low slot.
                let rem_start = slot_lock_offset(index + 1);
                let total_len = u64::from(remaining) * SLOT_DATA_LEN;
                let lower_count = remaining / 2;
                let lower_len = u64::from(lower_count) * SLOT_DATA_LEN;
                let upper_len = total_len - lower_len;

                match range::try_lock(&file, LockKind::Shared, rem_start + lower_len, upper_len)? {
                    None => {
                        index += 1;
                        continue;
                    }
                    Some(upper) => drop(upper),
                }
                match range::try_lock(&file, LockKind::Shared, rem_start, lower_len)? {
                    None => {
                        index += 1;
                        continue;
                    }
                    Some(lower) => drop(lower),
                }
                // Both halves were lockable: no more daemons.
                return Ok(ports);
            }
            None => {
                // Slot held by a live daemon; wait out initialization.
                let data = range::lock(
                    &file,
                    LockKind::Shared,
                    slot_data_offset(index),
                    SLOT_DATA_LEN,
                )?;
                let mut buf = [0u8; 4];
                let port = match file.read_exact_at(&mut buf, slot_data_offset(index)) {
                    Ok(()) => i32::from_be_bytes(buf),
                    Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => 0,
                    Err(err) => return Err(SlotLockError::Io(err)),
                };
                drop(data);
                if port > 0 && port <= i32::from(u16::MAX) {
                    ports.push(port as u16);
                }
            }
        }
        index += 1;
    }
    Ok(ports)
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SlotLockError {
    #[error("unable to acquire a daemon slot; already running {SLOT_INDEX_END} daemons?")]
    SlotsExhausted,

    #[error("slot {index} initialization already finished")]
    InitializationFinished { index: u32 },

    #[error("lock file error: {0}")]
    Io(#[from] io::Error),
}

/// Byte-range locks over a shared file handle.
///
/// Uses open-file-description locks (`F_OFD_SETLK`), so locks are owned by
/// the open handle rather than the process: a second handle opened by the
/// same process conflicts exactly like another process would, and closing an
/// unrelated descriptor of the same file cannot drop our locks.
///
/// The raw `fcntl` calls are the crate's only unsafe code; the crate root
/// denies `unsafe_code` everywhere else.
#[allow(unsafe_code)]
mod range {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::sync::Arc;

    #[derive(Clone, Copy)]
    pub(super) enum LockKind {
        Shared,
        Exclusive,
    }

    impl LockKind {
        fn lock_type(self) -> libc::c_short {
            match self {
                LockKind::Shared => libc::F_RDLCK as libc::c_short,
                LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
            }
        }
    }

    /// A held byte-range lock; released on drop.
    pub(super) struct RangeLock {
        file: Arc<File>,
        offset: u64,
        len: u64,
    }

    /// Non-blocking acquire. `Ok(None)` means a conflicting lock is held.
    pub(super) fn try_lock(
        file: &Arc<File>,
        kind: LockKind,
        offset: u64,
        len: u64,
    ) -> io::Result<Option<RangeLock>> {
        match fcntl_lock(file, libc::F_OFD_SETLK, kind.lock_type(), offset, len) {
            Ok(()) => Ok(Some(RangeLock {
                file: Arc::clone(file),
                offset,
                len,
            })),
            Err(err)
                if err.raw_os_error() == Some(libc::EAGAIN)
                    || err.raw_os_error() == Some(libc::EACCES) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Blocking acquire.
    pub(super) fn lock(
        file: &Arc<File>,
        kind: LockKind,
        offset: u64,
        len: u64,
    ) -> io::Result<RangeLock> {
        fcntl_lock(file, libc::F_OFD_SETLKW, kind.lock_type(), offset, len)?;
        Ok(RangeLock {
            file: Arc::clone(file),
            offset,
            len,
        })
    }

    impl Drop for RangeLock {
        fn drop(&mut self) {
            let _ = fcntl_lock(
                &self.file,
                libc::F_OFD_SETLK,
                libc::F_UNLCK as libc::c_short,
                self.offset,
                self.len,
            );
        }
    }

    fn fcntl_lock(
        file: &File,
        cmd: libc::c_int,
        lock_type: libc::c_short,
        offset: u64,
        len: u64,
    ) -> io::Result<()> {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = lock_type;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = offset as libc::off_t;
        fl.l_len = len as libc::off_t;
        // OFD locks require l_pid == 0; zeroed above.
        loop {
            // SAFETY: the fd is valid for the lifetime of `file` and the
            // flock struct is fully initialized.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, std::ptr::from_ref(&fl)) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
    }
}
