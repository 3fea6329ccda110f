//! Tracked file descriptors for the hook layer
//!
//! The hook only reroutes sockets it knows about. A tracked socket is
//! forced nonblocking at the kernel while the user-visible blocking mode is
//! emulated with the IO manager; the entity remembers which mode the user
//! asked for plus per-fd timeouts.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::config;

pub struct FdEntity {
    fd: RawFd,
    is_socket: bool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    // Milliseconds; 0 falls back to the configured default.
    connect_timeout_ms: AtomicU64,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdEntity {
    fn probe(fd: RawFd) -> Self {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut st) } == 0
            && (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
        }
        Self {
            fd,
            is_socket,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            connect_timeout_ms: AtomicU64::new(0),
            recv_timeout_ms: AtomicU64::new(0),
            send_timeout_ms: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn connect_timeout(&self) -> Duration {
        match self.connect_timeout_ms.load(Ordering::SeqCst) {
            0 => config::global().connect_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        match self.recv_timeout_ms.load(Ordering::SeqCst) {
            0 => config::global().recv_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        match self.send_timeout_ms.load(Ordering::SeqCst) {
            0 => config::global().send_timeout,
            ms => Duration::from_millis(ms),
        }
    }

    pub fn set_connect_timeout(&self, t: Duration) {
        self.connect_timeout_ms
            .store(t.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_recv_timeout(&self, t: Duration) {
        self.recv_timeout_ms
            .store(t.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_send_timeout(&self, t: Duration) {
        self.send_timeout_ms
            .store(t.as_millis() as u64, Ordering::SeqCst);
    }
}

/// Process-wide registry of tracked fds, indexed by fd number.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdEntity>>>>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    /// Look up `fd`, creating an entity when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdEntity>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(e)) = slots.get(idx) {
                return Some(e.clone());
            }
            if !auto_create {
                return None;
            }
        }
        let mut slots = self.slots.write().unwrap();
        if idx >= slots.len() {
            let target = (idx + 1).max(slots.len() + slots.len() / 2);
            slots.resize(target, None);
        }
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdEntity::probe(fd)));
        }
        slots[idx].clone()
    }

    /// Forget `fd`; an entity already handed out reads as closed.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(e) = slot.take() {
                e.mark_closed();
            }
        }
    }
}

/// The process-wide fd table.
pub fn fd_table() -> &'static FdTable {
    static TABLE: OnceLock<FdTable> = OnceLock::new();
    TABLE.get_or_init(FdTable::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_pipe_is_not_a_socket() {
        let (rd, _wr) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let e = fd_table().get(rd.as_raw_fd(), true).unwrap();
        assert!(!e.is_socket());
        fd_table().remove(rd.as_raw_fd());
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let e = fd_table().get(fd, true).unwrap();
        assert!(e.is_socket());
        assert!(!e.user_nonblock());
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);
        fd_table().remove(fd);
        assert!(e.is_closed());
        assert!(fd_table().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeouts_default_to_config() {
        let (rd, _wr) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let e = fd_table().get(rd.as_raw_fd(), true).unwrap();
        assert_eq!(e.recv_timeout(), config::global().recv_timeout);
        e.set_recv_timeout(Duration::from_millis(250));
        assert_eq!(e.recv_timeout(), Duration::from_millis(250));
        fd_table().remove(rd.as_raw_fd());
    }
}
