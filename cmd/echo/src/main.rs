//! TCP echo server on hooked blocking calls
//!
//! Every connection is one coroutine writing straight-line accept/read/write
//! code; the IO manager multiplexes them over a small worker pool.
//!
//! ```text
//! cargo run -p weft-echo -- 8099
//! printf 'hello\n' | nc 127.0.0.1 8099
//! ```

use std::sync::Arc;

use weft::{hook, init_logging, kerror, kinfo, IoManager, ScheduleExt};

fn serve_conn(fd: i32) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::read(fd, &mut buf);
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let w = hook::write(fd, &buf[off..n as usize]);
            if w <= 0 {
                hook::close(fd);
                return;
            }
            off += w as usize;
        }
    }
    hook::close(fd);
}

/// Create, bind and listen; `hook::socket` on a worker thread gives us a
/// tracked nonblocking fd, so the accept loop parks instead of spinning.
fn listen_on(port: u16) -> i32 {
    let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
    assert!(fd >= 0, "socket failed");
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    assert!(rc == 0, "bind failed: {}", std::io::Error::last_os_error());
    let rc = unsafe { libc::listen(fd, 1024) };
    assert!(rc == 0, "listen failed");
    fd
}

fn acceptor(iom: Arc<IoManager>, port: u16) {
    let listen_fd = listen_on(port);
    // An idle listener should wait indefinitely, not trip the default
    // hooked-read timeout.
    hook::set_recv_timeout(listen_fd, std::time::Duration::from_secs(3600));
    kinfo!("echo server listening on 0.0.0.0:{}", port);

    loop {
        if iom.is_stopping() {
            break;
        }
        let cfd = hook::accept(listen_fd);
        if cfd < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ETIMEDOUT) {
                continue;
            }
            kerror!("accept failed: {}", err);
            break;
        }
        kinfo!("accepted fd {}", cfd);
        iom.schedule(move || serve_conn(cfd as i32));
    }
    hook::close(listen_fd);
}

fn main() {
    init_logging();
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|a| a.parse().ok())
        .unwrap_or(8099);

    let iom = IoManager::new("echo", true, 4);
    println!("starting echo server on port {}", port);

    let i = iom.clone();
    iom.schedule(move || acceptor(i.clone(), port));
    iom.start();
}
