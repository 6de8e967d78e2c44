// src/syscalls.rs
//
// Thin wrappers around the raw Linux syscalls the transports need: socket
// setup, non-blocking accept, epoll, Linux AIO, eventfd, and O_DIRECT file
// opens. Listen-socket creation/binding itself is out of scope as a tested
// unit (it is the "thin outer harness" each binary wires up once at
// startup) but still needs a real implementation to run at all.

use crate::error::FtResult;
use libc::{c_int, c_void, off_t, size_t, socklen_t};
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;

/// Create, bind and listen on `0.0.0.0:port`. `nonblocking` controls
/// whether the listener fd itself is non-blocking (readiness/completion
/// transports) or left blocking (the blocking/process/thread transports,
/// which call `accept()` and let it block the calling thread).
pub fn create_listen_socket(port: u16, backlog: i32, nonblocking: bool) -> FtResult<RawFd> {
    unsafe {
        let flags = libc::SOCK_STREAM | if nonblocking { libc::SOCK_NONBLOCK } else { 0 };
        let fd = libc::socket(libc::AF_INET, flags, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: libc::INADDR_ANY },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Blocking `accept()`, for the transports that dedicate a whole
/// OS thread (or process) to one connection.
pub fn accept_blocking(listen_fd: RawFd) -> FtResult<RawFd> {
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

/// Non-blocking `accept4()` with `SOCK_NONBLOCK`, for the readiness and
/// completion transports. `Ok(None)` on `EAGAIN`/`EWOULDBLOCK` means the
/// accept queue is drained for now.
pub fn accept_nonblocking(listen_fd: RawFd) -> FtResult<Option<RawFd>> {
    unsafe {
        let fd = libc::accept4(listen_fd, ptr::null_mut(), ptr::null_mut(), libc::SOCK_NONBLOCK);
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        Ok(Some(fd))
    }
}

pub fn set_nonblocking(fd: RawFd) -> FtResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Open a file for GET: read-only, `O_DIRECT`. `nonblocking` additionally
/// sets `O_NONBLOCK`, which the async transports use on the socket side
/// but also apply here for consistency (it has no effect on regular files
/// but the original sources pass it through unconditionally).
pub fn open_for_get(path: &str, nonblocking: bool) -> FtResult<RawFd> {
    let c_path = std::ffi::CString::new(path).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte")
    })?;
    let mut flags = libc::O_RDONLY | libc::O_DIRECT;
    if nonblocking {
        flags |= libc::O_NONBLOCK;
    }
    unsafe {
        let fd = libc::open(c_path.as_ptr(), flags);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

/// Open a file for PUT: write-only, create/truncate, `O_DIRECT`, mode 0644.
pub fn open_for_put(path: &str, nonblocking: bool) -> FtResult<RawFd> {
    let c_path = std::ffi::CString::new(path).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte")
    })?;
    let mut flags = libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC | libc::O_DIRECT;
    if nonblocking {
        flags |= libc::O_NONBLOCK;
    }
    unsafe {
        let fd = libc::open(c_path.as_ptr(), flags, 0o644 as libc::mode_t);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

pub fn file_size(fd: RawFd) -> FtResult<u64> {
    unsafe {
        let mut st: libc::stat = mem::zeroed();
        if libc::fstat(fd, &mut st) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(st.st_size as u64)
    }
}

/// `Ok(None)` means `EAGAIN`/`EWOULDBLOCK` — no data available right now,
/// distinct from `Ok(Some(0))` which is a genuine EOF (peer closed).
/// `EINTR` is retried in a loop here rather than surfaced, so it never
/// reaches a caller as either of those.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> FtResult<Option<usize>> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        return Ok(Some(res as usize));
    }
}

/// Same `EAGAIN`/`EINTR` handling as `recv_nonblocking`, for writes.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> FtResult<Option<usize>> {
    loop {
        let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        return Ok(Some(res as usize));
    }
}

/// Positional read at `offset`, for GET's file side. `EINTR` is retried
/// in a loop rather than propagated — a signal landing mid-`pread` must
/// never turn into a client-visible error.
pub fn pread_at(fd: RawFd, buf: &mut [u8], offset: u64) -> FtResult<usize> {
    loop {
        let res = unsafe { libc::pread(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), offset as off_t) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        return Ok(res as usize);
    }
}

/// Positional write at `offset`, for PUT's file side. Same `EINTR` retry
/// as `pread_at`.
pub fn pwrite_at(fd: RawFd, buf: &[u8], offset: u64) -> FtResult<usize> {
    loop {
        let res = unsafe { libc::pwrite(fd, buf.as_ptr() as *const c_void, buf.len(), offset as off_t) };
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err.into());
        }
        return Ok(res as usize);
    }
}

// ---- epoll ----

pub use epoll::Epoll;

mod epoll {
    use super::*;
    use libc::{epoll_event, EPOLLET};

    pub struct Epoll {
        pub fd: RawFd,
    }

    impl Epoll {
        pub fn new() -> FtResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: RawFd, token: u64, interests: i32) -> FtResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn modify(&self, fd: RawFd, token: u64, interests: i32) -> FtResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) -> FtResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> FtResult<usize> {
            unsafe {
                let res = libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- eventfd, for the epoll+AIO transport's completion notifications ----

pub fn eventfd_create() -> FtResult<RawFd> {
    unsafe {
        let fd = libc::eventfd(0, libc::EFD_NONBLOCK);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

/// Drain an eventfd's counter; returns the accumulated value (roughly: how
/// many completions were signalled since the last drain).
pub fn eventfd_read(fd: RawFd) -> FtResult<u64> {
    let mut buf = [0u8; 8];
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, 8);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err.into());
        }
        Ok(u64::from_ne_bytes(buf))
    }
}

// ---- Linux AIO (io_setup / io_submit / io_getevents / io_destroy) ----
//
// Not exposed by `libc` as typed functions (only the struct/const
// definitions are), so these go through `libc::syscall` directly, the
// same way the kernel's own man pages document calling them.

#[allow(non_camel_case_types)]
pub type aio_context_t = libc::c_ulong;

pub fn io_setup(max_events: u32) -> FtResult<aio_context_t> {
    let mut ctx: aio_context_t = 0;
    let res = unsafe { libc::syscall(libc::SYS_io_setup, max_events as libc::c_long, &mut ctx as *mut aio_context_t) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(ctx)
}

pub fn io_destroy(ctx: aio_context_t) -> FtResult<()> {
    let res = unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// Submit `iocbs` (an array of `*mut libc::iocb`) for processing. Returns
/// the number actually submitted.
pub fn io_submit(ctx: aio_context_t, iocbs: &mut [*mut libc::iocb]) -> FtResult<usize> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_submit,
            ctx,
            iocbs.len() as libc::c_long,
            iocbs.as_mut_ptr(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(res as usize)
}

/// Reap up to `events.len()` completions, blocking up to `timeout` (or
/// returning immediately if `None` and none are ready — the AIO transport
/// always calls this with a zero timeout since it is woken by the
/// eventfd, not by blocking inside `io_getevents` itself).
pub fn io_getevents(
    ctx: aio_context_t,
    min_events: usize,
    events: &mut [libc::io_event],
    timeout: Option<libc::timespec>,
) -> FtResult<usize> {
    let ts_ptr = match &timeout {
        Some(t) => t as *const libc::timespec,
        None => ptr::null(),
    };
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min_events as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            ts_ptr,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(res as usize)
}

/// Build an `iocb` for a positional read, tagged with `eventfd` so its
/// completion posts to the AIO transport's single eventfd.
pub fn prep_pread(fd: RawFd, buf: &mut [u8], offset: u64, eventfd: RawFd, user_data: u64) -> libc::iocb {
    let mut iocb: libc::iocb = unsafe { mem::zeroed() };
    iocb.aio_fildes = fd as u32;
    iocb.aio_lio_opcode = libc::IOCB_CMD_PREAD as u16;
    iocb.aio_buf = buf.as_mut_ptr() as u64;
    iocb.aio_nbytes = buf.len() as size_t as u64;
    iocb.aio_offset = offset as i64;
    iocb.aio_data = user_data;
    iocb.aio_flags = libc::IOCB_FLAG_RESFD as u32;
    iocb.aio_resfd = eventfd as u32;
    iocb
}

/// Build an `iocb` for a positional write, same eventfd tagging as above.
pub fn prep_pwrite(fd: RawFd, buf: &[u8], offset: u64, eventfd: RawFd, user_data: u64) -> libc::iocb {
    let mut iocb: libc::iocb = unsafe { mem::zeroed() };
    iocb.aio_fildes = fd as u32;
    iocb.aio_lio_opcode = libc::IOCB_CMD_PWRITE as u16;
    iocb.aio_buf = buf.as_ptr() as u64;
    iocb.aio_nbytes = buf.len() as size_t as u64;
    iocb.aio_offset = offset as i64;
    iocb.aio_data = user_data;
    iocb.aio_flags = libc::IOCB_FLAG_RESFD as u32;
    iocb.aio_resfd = eventfd as u32;
    iocb
}
