//! Blocking-call interception
//!
//! Drop-in replacements for the blocking socket calls. On a worker thread
//! with hooking enabled, a call that would block instead arms the fd on the
//! IO manager and yields; the coroutine is resumed when the fd turns ready
//! or the per-fd timeout fires. Off a worker thread, or for fds the runtime
//! does not track, every wrapper falls through to the raw call.
//!
//! Wrappers keep the C calling convention: -1 with errno on failure, so
//! ETIMEDOUT comes back exactly where EAGAIN would have.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weft_core::kerror;

use crate::coroutine::Coroutine;
use crate::fd::fd_table;
use crate::iomanager::{EventKind, IoManager};
use crate::scheduler::ScheduleExt;
use crate::tls;

pub use crate::tls::{enable_hook, hook_enabled};

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe { *libc::__errno_location() = e };
}

/// Coroutine-aware sleep. Outside a coroutine this blocks the thread.
pub fn sleep(d: Duration) {
    if !hook_enabled() {
        std::thread::sleep(d);
        return;
    }
    // Only weak handles to the manager may survive past the yield.
    {
        let (Some(iom), Some(co)) = (IoManager::current(), tls::running()) else {
            std::thread::sleep(d);
            return;
        };
        let tid = tls::current_tid();
        let weak = Arc::downgrade(&iom);
        iom.add_timer(
            d,
            move || {
                if let Some(iom) = weak.upgrade() {
                    iom.schedule_co(co.clone(), tid);
                }
            },
            false,
        );
    }
    Coroutine::yield_current();
}

/// Millisecond convenience over [`sleep`].
pub fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms));
}

enum WaitOutcome {
    Ready,
    TimedOut,
    Failed,
}

/// Park the running coroutine until `fd` is ready for `kind`, bounded by
/// `timeout` (zero means no bound).
fn wait_ready(fd: RawFd, kind: EventKind, timeout: Duration) -> WaitOutcome {
    let timed_out = Arc::new(AtomicBool::new(false));
    // The manager handle is scoped out before the yield; the armed timer
    // and the suspended frame hold only weak references back to it.
    let timer = {
        let Some(iom) = IoManager::current() else {
            kerror!("hooked io on fd {} without an io manager", fd);
            set_errno(libc::ENOTSUP);
            return WaitOutcome::Failed;
        };
        let timer = if !timeout.is_zero() {
            let flag = Arc::downgrade(&timed_out);
            let weak_iom = Arc::downgrade(&iom);
            Some(iom.add_cond_timer(
                timeout,
                move || {
                    let Some(flag) = flag.upgrade() else { return };
                    flag.store(true, Ordering::SeqCst);
                    if let Some(iom) = weak_iom.upgrade() {
                        iom.cancel_event(fd, kind);
                    }
                },
                Arc::downgrade(&timed_out),
                false,
            ))
        } else {
            None
        };
        if !iom.add_event(fd, kind) {
            if let Some(t) = &timer {
                iom.cancel_timer(t);
            }
            set_errno(libc::EIO);
            return WaitOutcome::Failed;
        }
        timer
    };
    Coroutine::yield_current();
    if let Some(t) = &timer {
        if let Some(iom) = IoManager::current() {
            iom.cancel_timer(t);
        }
    }
    if timed_out.load(Ordering::SeqCst) {
        WaitOutcome::TimedOut
    } else {
        WaitOutcome::Ready
    }
}

/// The shared retry protocol: try the call, park on EAGAIN, retry on wake.
fn do_io(fd: RawFd, kind: EventKind, mut op: impl FnMut() -> isize) -> isize {
    if !hook_enabled() {
        return op();
    }
    let Some(entity) = fd_table().get(fd, false) else {
        return op();
    };
    if entity.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entity.is_socket() || entity.user_nonblock() {
        return op();
    }
    let timeout = match kind {
        EventKind::Read => entity.recv_timeout(),
        EventKind::Write => entity.send_timeout(),
    };
    loop {
        let mut n = op();
        while n == -1 && errno() == libc::EINTR {
            n = op();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }
        match wait_ready(fd, kind, timeout) {
            WaitOutcome::Ready => continue,
            WaitOutcome::Failed => return -1,
            WaitOutcome::TimedOut => {
                // Readiness may have raced the timer; only report the
                // timeout when the fd still has nothing.
                let mut n = op();
                while n == -1 && errno() == libc::EINTR {
                    n = op();
                }
                if !(n == -1 && errno() == libc::EAGAIN) {
                    return n;
                }
                set_errno(libc::ETIMEDOUT);
                return -1;
            }
        }
    }
}

/// `socket(2)`; a new socket is tracked when hooking is on.
pub fn socket(domain: i32, ty: i32, protocol: i32) -> RawFd {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && hook_enabled() {
        fd_table().get(fd, true);
    }
    fd
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut ss: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in, sin) };
            (ss, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { std::ptr::write(&mut ss as *mut _ as *mut libc::sockaddr_in6, sin6) };
            (ss, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// `connect(2)` with EINPROGRESS handled through the IO manager and the
/// result read back from SO_ERROR.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> isize {
    let (ss, len) = sockaddr_of(addr);
    let raw = || unsafe { libc::connect(fd, &ss as *const _ as *const libc::sockaddr, len) as isize };
    if !hook_enabled() {
        return raw();
    }
    let Some(entity) = fd_table().get(fd, false) else {
        return raw();
    };
    if entity.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !entity.is_socket() || entity.user_nonblock() {
        return raw();
    }
    let n = raw();
    if n == 0 {
        return 0;
    }
    if !(n == -1 && errno() == libc::EINPROGRESS) {
        return n;
    }
    match wait_ready(fd, EventKind::Write, entity.connect_timeout()) {
        WaitOutcome::Ready => {}
        WaitOutcome::Failed => return -1,
        WaitOutcome::TimedOut => {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }
    let mut err: libc::c_int = 0;
    let mut elen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut elen,
        )
    };
    if rc != 0 {
        return -1;
    }
    if err != 0 {
        set_errno(err);
        return -1;
    }
    0
}

/// `accept(2)`; the accepted fd is tracked when hooking is on.
pub fn accept(fd: RawFd) -> isize {
    let n = do_io(fd, EventKind::Read, || unsafe {
        libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) as isize
    });
    if n >= 0 && hook_enabled() {
        fd_table().get(n as RawFd, true);
    }
    n
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    do_io(fd, EventKind::Read, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    do_io(fd, EventKind::Read, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    do_io(fd, EventKind::Write, || unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    do_io(fd, EventKind::Write, || unsafe {
        libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
    })
}

/// `close(2)`; pending waiters on a tracked fd are cancelled first so no
/// coroutine stays parked on a dead fd.
pub fn close(fd: RawFd) -> isize {
    if hook_enabled() && fd_table().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all_event(fd);
        }
        fd_table().remove(fd);
    }
    unsafe { libc::close(fd) as isize }
}

/// Flip the user-visible blocking mode. A tracked socket stays nonblocking
/// at the kernel; only the emulation changes.
pub fn set_nonblocking(fd: RawFd, on: bool) -> isize {
    if hook_enabled() {
        if let Some(e) = fd_table().get(fd, false) {
            if e.is_socket() && !e.is_closed() {
                e.set_user_nonblock(on);
                return 0;
            }
        }
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return -1;
    }
    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags) as isize }
}

fn timeval_of(t: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: t.as_secs() as libc::time_t,
        tv_usec: t.subsec_micros() as libc::suseconds_t,
    }
}

fn set_sockopt_timeout(fd: RawFd, opt: i32, t: Duration) -> isize {
    let tv = timeval_of(t);
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            opt,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        ) as isize
    }
}

pub fn set_recv_timeout(fd: RawFd, t: Duration) -> isize {
    if hook_enabled() {
        if let Some(e) = fd_table().get(fd, false) {
            e.set_recv_timeout(t);
            return 0;
        }
    }
    set_sockopt_timeout(fd, libc::SO_RCVTIMEO, t)
}

pub fn set_send_timeout(fd: RawFd, t: Duration) -> isize {
    if hook_enabled() {
        if let Some(e) = fd_table().get(fd, false) {
            e.set_send_timeout(t);
            return 0;
        }
    }
    set_sockopt_timeout(fd, libc::SO_SNDTIMEO, t)
}

/// Only meaningful for a tracked socket; there is no kernel equivalent.
pub fn set_connect_timeout(fd: RawFd, t: Duration) -> isize {
    if let Some(e) = fd_table().get(fd, false) {
        e.set_connect_timeout(t);
        return 0;
    }
    set_errno(libc::ENOTSUP);
    -1
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Instant;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc =
            unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_sleep_suspends_only_the_coroutine() {
        let iom = IoManager::new("hk-sleep", true, 1);
        let slept = Arc::new(Mutex::new(None));
        let s = slept.clone();
        let i = iom.clone();
        iom.schedule(move || {
            let t0 = Instant::now();
            sleep(Duration::from_millis(50));
            *s.lock().unwrap() = Some(t0.elapsed());
            i.stop();
        });
        iom.start();
        let elapsed = slept.lock().unwrap().expect("sleep never finished");
        assert!(elapsed >= Duration::from_millis(45), "slept {:?}", elapsed);
    }

    #[test]
    fn test_read_reports_timeout_once() {
        let (rd, _wr) = socketpair();
        fd_table()
            .get(rd, true)
            .unwrap()
            .set_recv_timeout(Duration::from_millis(100));

        let iom = IoManager::new("hk-timeout", true, 1);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        let i = iom.clone();
        iom.schedule(move || {
            let mut buf = [0u8; 16];
            let t0 = Instant::now();
            let n = read(rd, &mut buf);
            let err = errno();
            *r.lock().unwrap() = Some((n, err, t0.elapsed()));
            i.stop();
        });
        iom.start();

        let (n, err, elapsed) = result.lock().unwrap().expect("read never returned");
        assert_eq!(n, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(
            elapsed >= Duration::from_millis(90) && elapsed <= Duration::from_millis(300),
            "timed out after {:?}",
            elapsed
        );
        fd_table().remove(rd);
        unsafe { libc::close(rd) };
    }

    #[test]
    fn test_read_wakes_on_data() {
        let (rd, wr) = socketpair();
        fd_table().get(rd, true).unwrap();

        let iom = IoManager::new("hk-data", true, 1);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        let i = iom.clone();
        iom.schedule(move || {
            let mut buf = [0u8; 16];
            let n = read(rd, &mut buf);
            *r.lock().unwrap() = Some((n, buf[..4].to_vec()));
            i.stop();
        });
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            unsafe { libc::write(wr, b"ping".as_ptr() as *const libc::c_void, 4) };
        });
        iom.start();

        let (n, data) = result.lock().unwrap().clone().expect("read never returned");
        assert_eq!(n, 4);
        assert_eq!(data, b"ping");
        fd_table().remove(rd);
        unsafe { libc::close(rd) };
    }

    #[test]
    fn test_user_nonblock_passes_through() {
        let (rd, _wr) = socketpair();
        fd_table().get(rd, true).unwrap();

        let iom = IoManager::new("hk-nb", true, 1);
        let result = Arc::new(Mutex::new(None));
        let r = result.clone();
        let i = iom.clone();
        iom.schedule(move || {
            assert_eq!(set_nonblocking(rd, true), 0);
            let mut buf = [0u8; 16];
            let t0 = Instant::now();
            let n = read(rd, &mut buf);
            *r.lock().unwrap() = Some((n, errno(), t0.elapsed()));
            i.stop();
        });
        iom.start();

        let (n, err, elapsed) = result.lock().unwrap().expect("read never returned");
        assert_eq!(n, -1);
        assert_eq!(err, libc::EAGAIN);
        assert!(elapsed < Duration::from_millis(50));
        fd_table().remove(rd);
        unsafe { libc::close(rd) };
    }

    #[test]
    fn test_sleeper_timer_does_not_pin_manager() {
        let iom = IoManager::new("hk-drop-sleep", false, 1);
        iom.start();
        let entered = Arc::new(AtomicBool::new(false));
        let e = entered.clone();
        iom.schedule(move || {
            e.store(true, Ordering::SeqCst);
            sleep(Duration::from_secs(3600));
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while !entered.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(entered.load(Ordering::SeqCst));
        // Let the coroutine arm its wakeup timer and yield.
        std::thread::sleep(Duration::from_millis(50));
        iom.stop();
        iom.join();

        let weak = Arc::downgrade(&iom);
        drop(iom);
        assert!(
            weak.upgrade().is_none(),
            "outstanding sleep timer kept the manager alive"
        );
    }

    #[test]
    fn test_parked_reader_does_not_pin_manager() {
        let (rd, wr) = socketpair();
        fd_table().get(rd, true).unwrap();

        let iom = IoManager::new("hk-drop-read", false, 1);
        iom.start();
        iom.schedule(move || {
            let mut buf = [0u8; 8];
            read(rd, &mut buf);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        while iom.pending_events() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(iom.pending_events(), 1);
        iom.stop();
        iom.join();

        // The read event and its timeout timer are still armed; neither may
        // hold a strong reference back to the manager.
        let weak = Arc::downgrade(&iom);
        drop(iom);
        assert!(
            weak.upgrade().is_none(),
            "armed event or timeout timer kept the manager alive"
        );
        fd_table().remove(rd);
        unsafe { libc::close(rd) };
        unsafe { libc::close(wr) };
    }

    #[test]
    fn test_tcp_connect_write_read_close() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            use std::io::{Read, Write};
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let iom = IoManager::new("hk-tcp", true, 1);
        let echoed = Arc::new(AtomicUsize::new(0));
        let e = echoed.clone();
        let i = iom.clone();
        iom.schedule(move || {
            let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            assert!(fd >= 0);
            assert_eq!(connect(fd, &addr), 0);
            assert_eq!(write(fd, b"echo"), 4);
            let mut buf = [0u8; 4];
            assert_eq!(read(fd, &mut buf), 4);
            assert_eq!(&buf, b"echo");
            assert_eq!(close(fd), 0);
            e.fetch_add(1, Ordering::SeqCst);
            i.stop();
        });
        iom.start();

        assert_eq!(echoed.load(Ordering::SeqCst), 1);
        server.join().unwrap();
    }
}
