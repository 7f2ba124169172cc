use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Once;

pub(crate) mod selector;
pub(crate) mod socket;
pub(crate) mod timerfd;
pub(crate) mod waker;

/// Ignore `SIGPIPE` once per process.
///
/// Writing to a peer that already closed its read end must surface as an
/// `EPIPE` error on the write path, not kill the process.
pub(crate) fn ignore_sigpipe() {
    static IGNORE: Once = Once::new();
    IGNORE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Open `/dev/null` as a placeholder descriptor.
///
/// The acceptor parks one of these so it can free a descriptor when
/// `accept` fails with `EMFILE` and drain the kernel backlog.
pub(crate) fn spare_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC,
    ))?;
    // SAFETY: `open(2)` just returned this fd and nothing else owns it.
    Ok(unsafe { File::from_raw_fd(fd) }.into())
}

/// Host name as reported by `gethostname(2)`, for log file names.
pub(crate) fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];
    let res = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if res != 0 {
        return String::from("unknownhost");
    }
    // SAFETY: `gethostname` nul-terminates within the truncated buffer.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
