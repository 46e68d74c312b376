// Signal and I/O boundary.
//
// Positional reads and writes that retry through EINTR, plus the
// minimal signal wiring: handlers only set the process-wide flag in
// `crate::set_interrupted` and return; the main loop polls it between
// iterations and re-raises at exit.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Outcome of a positional read. `bytes < requested` with no error
/// means EOF was reached.
#[derive(Debug)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub error: Option<io::Error>,
}

impl ReadOutcome {
    pub fn is_eof(&self, requested: usize) -> bool {
        self.error.is_none() && self.bytes < requested
    }
}

/// Read `buf.len()` bytes at `pos`, retrying interrupted calls.
/// A short count without an error is EOF; an error after a partial
/// read reports both the bytes salvaged and the error.
pub fn readblock(f: &File, buf: &mut [u8], pos: u64) -> ReadOutcome {
    let mut sz = 0;
    while sz < buf.len() {
        match f.read_at(&mut buf[sz..], pos + sz as u64) {
            Ok(0) => break, // EOF
            Ok(n) => sz += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome { bytes: sz, error: Some(e) },
        }
    }
    ReadOutcome { bytes: sz, error: None }
}

/// Write the whole buffer at `pos`, retrying interrupted calls.
/// Anything short of a full write is an error.
pub fn writeblock(f: &File, buf: &[u8], pos: u64) -> io::Result<()> {
    let mut sz = 0;
    while sz < buf.len() {
        match f.write_at(&buf[sz..], pos + sz as u64) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "device full")),
            Ok(n) => sz += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub fn is_all_zero(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == 0)
}

extern "C" fn forward_signal(signum: libc::c_int) {
    crate::set_interrupted(signum);
}

fn set_handler(signum: libc::c_int, handler: usize) -> io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signum, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Route hangup, interrupt and termination through the cooperative
/// flag; user signals are ignored so they cannot kill a long rescue.
pub fn set_signals() -> io::Result<()> {
    crate::reset_interrupted();
    for signum in [libc::SIGHUP, libc::SIGINT, libc::SIGTERM] {
        set_handler(signum, forward_signal as usize)?;
    }
    for signum in [libc::SIGUSR1, libc::SIGUSR2] {
        set_handler(signum, libc::SIG_IGN)?;
    }
    Ok(())
}

/// Re-raise the recorded signal against its default disposition so the
/// process reports the conventional status; the returned code is the
/// fallback in case the raise does not terminate us.
pub fn signaled_exit() -> i32 {
    let signum = crate::interrupt_signum();
    unsafe {
        let _ = set_handler(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
    128 + signum
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_readblock_short_read_is_eof() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0xAB; 100]).unwrap();
        f.flush().unwrap();
        let file = f.reopen().unwrap();

        let mut buf = [0u8; 64];
        let out = readblock(&file, &mut buf, 50);
        assert_eq!(out.bytes, 50);
        assert!(out.is_eof(64));
        assert!(buf[..50].iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_writeblock_then_readblock() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let file = f.reopen().unwrap();
        writeblock(&file, &[7u8; 32], 16).unwrap();

        let mut buf = [0u8; 32];
        let out = readblock(&file, &mut buf, 16);
        assert_eq!(out.bytes, 32);
        assert!(out.error.is_none());
        assert_eq!(buf, [7u8; 32]);
    }

    #[test]
    fn test_is_all_zero() {
        assert!(is_all_zero(&[0; 16]));
        assert!(!is_all_zero(&[0, 0, 1, 0]));
        assert!(is_all_zero(&[]));
    }
}
