//! Interrupt handling (SIGINT).
//!
//! We let the first SIGINT reach child processes, which fail their builds
//! and let the parent reap them and report properly.  The flag set here is
//! what turns those failures into an "interrupted by user" exit.

#[cfg(unix)]
use std::sync::atomic::AtomicBool;

#[cfg(unix)]
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
    INTERRUPTED.store(true, std::sync::atomic::Ordering::Relaxed);
    // SA_RESETHAND clears the handler, so a second ^C kills us directly.
}

#[cfg(unix)]
pub fn register_sigint() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = sigint_handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
pub fn was_interrupted() -> bool {
    INTERRUPTED.load(std::sync::atomic::Ordering::Relaxed)
}

#[cfg(not(unix))]
pub fn register_sigint() {}

#[cfg(not(unix))]
pub fn was_interrupted() -> bool {
    false
}
