//! Fatal signal reporting
//!
//! Installs handlers for SIGSEGV, SIGILL, SIGBUS and SIGFPE that print one
//! diagnostic line with the faulting address and then re-raise the signal
//! with the default action, so a core dump is still produced.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::error::{Result, RewindError};

/// Signals treated as crashes
pub const FATAL_SIGNALS: [libc::c_int; 4] = [libc::SIGSEGV, libc::SIGILL, libc::SIGBUS, libc::SIGFPE];

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the crash handlers (idempotent)
pub fn install() -> Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    for &sig in &FATAL_SIGNALS {
        // SAFETY: the handler only calls async-signal-safe functions; the
        // sigaction struct is fully initialized before use.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_fatal as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND | libc::SA_NODEFER;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(sig, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(RewindError::Io(std::io::Error::last_os_error())
                .with_context(format!("Failed to install handler for {}", signal_name(sig))));
        }
    }

    debug!("Crash handlers installed");
    Ok(())
}

/// Name of a fatal signal
pub fn signal_name(sig: libc::c_int) -> &'static str {
    match sig {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGILL => "SIGILL",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        _ => "signal",
    }
}

fn write_stderr(bytes: &[u8]) {
    // SAFETY: write(2) is async-signal-safe and the buffer is valid.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

/// Render `value` as `0x` plus 16 hex digits without allocating
fn format_hex(value: u64, buf: &mut [u8; 18]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    buf[0] = b'0';
    buf[1] = b'x';
    for i in 0..16 {
        let nibble = (value >> ((15 - i) * 4)) & 0xf;
        buf[2 + i] = DIGITS[nibble as usize];
    }
    &buf[..]
}

/// Render `value` in decimal without allocating
fn format_dec(mut value: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[start..]
}

extern "C" fn handle_fatal(sig: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let mut hex = [0u8; 18];
    let mut dec = [0u8; 20];

    write_stderr(b"rewind: fatal ");
    write_stderr(signal_name(sig).as_bytes());
    if !info.is_null() {
        // SAFETY: the kernel passes a valid siginfo_t with SA_SIGINFO; all
        // four handled signals fill in si_addr.
        let addr = unsafe { (*info).si_addr() } as usize as u64;
        write_stderr(b" at ");
        write_stderr(format_hex(addr, &mut hex));
    }
    // SAFETY: gettid(2) is async-signal-safe.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    write_stderr(b" in thread ");
    write_stderr(format_dec(tid as u64, &mut dec));
    write_stderr(b", aborting\n");

    // SA_RESETHAND restored the default action; deliver the signal again
    // SAFETY: signal() and raise() are async-signal-safe.
    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install().unwrap();
        install().unwrap();
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGSEGV), "SIGSEGV");
        assert_eq!(signal_name(libc::SIGFPE), "SIGFPE");
        assert_eq!(signal_name(libc::SIGTERM), "signal");
    }

    #[test]
    fn test_fault_address_formatting() {
        let mut buf = [0u8; 18];
        assert_eq!(format_hex(0, &mut buf), b"0x0000000000000000");
        assert_eq!(format_hex(0xdead_beef, &mut buf), b"0x00000000deadbeef");
        assert_eq!(format_hex(u64::MAX, &mut buf), b"0xffffffffffffffff");

        let mut buf = [0u8; 20];
        assert_eq!(format_dec(0, &mut buf), b"0");
        assert_eq!(format_dec(4211, &mut buf), b"4211");
        assert_eq!(format_dec(u64::MAX, &mut buf), b"18446744073709551615");
    }
}
