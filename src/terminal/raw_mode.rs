//! Outer terminal handling
//!
//! The bridged shell negotiates its own line discipline on the inner PTY, so
//! the outer terminal must pass every keystroke through untouched: no echo,
//! no line buffering, no signal generation from ^C/^Z.

use super::pty::TerminalSize;
use libc::c_int;
use std::io;
use std::os::unix::io::RawFd;
use tracing::debug;

pub fn is_tty(fd: RawFd) -> bool {
    unsafe { libc::isatty(fd as c_int) == 1 }
}

/// Query the window size of the terminal behind `fd`.
pub fn terminal_size(fd: RawFd) -> Option<TerminalSize> {
    let mut size = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe { libc::ioctl(fd as c_int, libc::TIOCGWINSZ, &mut size) };
    if result == 0 && size.ws_col > 0 && size.ws_row > 0 {
        Some(TerminalSize::new(size.ws_row, size.ws_col))
    } else {
        None
    }
}

fn get_termios(fd: RawFd) -> io::Result<libc::termios> {
    let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
    let result = unsafe { libc::tcgetattr(fd as c_int, &mut termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(termios)
}

fn set_termios(fd: RawFd, termios: &libc::termios) -> io::Result<()> {
    let result = unsafe { libc::tcsetattr(fd as c_int, libc::TCSANOW, termios) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Puts a terminal into raw mode and restores the saved attributes on drop.
pub struct RawModeGuard {
    fd: RawFd,
    saved: libc::termios,
}

impl RawModeGuard {
    /// Enable raw mode on `fd`. Returns `Ok(None)` when `fd` is not a TTY
    /// (piped input), in which case there is nothing to change or restore.
    pub fn enable(fd: RawFd) -> io::Result<Option<Self>> {
        if !is_tty(fd) {
            debug!(fd, "Not a TTY, leaving terminal mode unchanged");
            return Ok(None);
        }

        let saved = get_termios(fd)?;
        let mut raw = saved;
        unsafe { libc::cfmakeraw(&mut raw) };
        set_termios(fd, &raw)?;
        debug!(fd, "Raw mode enabled");

        Ok(Some(Self { fd, saved }))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = set_termios(self.fd, &self.saved) {
            tracing::warn!(fd = self.fd, error = %e, "Failed to restore terminal mode");
        } else {
            debug!(fd = self.fd, "Terminal mode restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_regular_file_is_not_a_tty() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_tty(file.as_raw_fd()));
        assert!(terminal_size(file.as_raw_fd()).is_none());
    }

    #[test]
    fn test_raw_mode_is_noop_without_tty() {
        let file = tempfile::tempfile().unwrap();
        let guard = RawModeGuard::enable(file.as_raw_fd()).unwrap();
        assert!(guard.is_none());
    }
}
