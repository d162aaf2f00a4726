//! Blocking descriptor waits for the synchronous driver.

use std::io;

use crate::engine::{Events, Readiness};

/// Wait for `readiness` on its descriptor, translating the wake reason
/// into [`Events`]. An elapsed timeout is [`Events::TIMEOUT`], not an
/// error.
pub(crate) fn wait(readiness: Readiness) -> io::Result<Events> {
    let mut events: libc::c_short = 0;
    if readiness.interest.contains(Events::READ) {
        events |= libc::POLLIN;
    }
    if readiness.interest.contains(Events::WRITE) {
        events |= libc::POLLOUT;
    }
    let mut pollfd = libc::pollfd {
        fd: readiness.fd,
        events,
        revents: 0,
    };
    let timeout = match readiness.timeout {
        Some(timeout) => timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    loop {
        let n = unsafe { libc::poll(&mut pollfd, 1, timeout) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(Events::TIMEOUT);
        }
        let mut observed = Events::empty();
        if pollfd.revents & libc::POLLIN != 0 {
            observed |= Events::READ;
        }
        if pollfd.revents & libc::POLLOUT != 0 {
            observed |= Events::WRITE;
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            observed |= Events::ERROR;
        }
        return Ok(observed);
    }
}
