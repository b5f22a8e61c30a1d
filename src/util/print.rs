use std::ffi::c_void;

/// Write `s` to stderr without touching the allocator or any lock that the
/// allocator might be holding. Short writes are retried, errors are ignored.
pub fn putstr(s: &str) {
    let mut bytes = s.as_bytes();
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice, so the pointer is valid for reads
        // of `bytes.len()` bytes.
        let written =
            unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Format `n` as hex into `buf` without allocating, returning the digits
pub fn hex(mut n: usize, buf: &mut [u8; 18]) -> &str {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut i = buf.len();
    loop {
        i -= 1;
        buf[i] = DIGITS[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    i -= 1;
    buf[i] = b'x';
    i -= 1;
    buf[i] = b'0';
    // SAFETY: we only wrote ASCII
    unsafe { std::str::from_utf8_unchecked(&buf[i..]) }
}

/// Print a message and kill the process. Used for the failures this
/// allocator cannot run degraded through (bad options, `mmap()` failures).
#[cold]
pub fn die(message: &str) -> ! {
    putstr("guardpool: ");
    putstr(message);
    putstr("\n");
    std::process::abort()
}

/// Like [`die()`] but also names the current `errno`
#[cold]
pub fn die_errno(message: &str) -> ! {
    // SAFETY: `__errno_location()` always returns a valid thread-local pointer
    let errno = unsafe { *libc::__errno_location() };
    putstr("guardpool: ");
    putstr(message);
    putstr(", errno() = ");
    putstr(match errno {
        libc::ENOMEM => "ENOMEM", // It's basically just this one
        libc::EACCES => "EACCES",
        libc::EAGAIN => "EAGAIN",
        libc::EBADF => "EBADF",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EPERM => "EPERM",
        _ => "unknown",
    });
    putstr("\n");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::hex;

    #[test]
    fn hex_formats_without_allocating() {
        let mut buf = [0u8; 18];
        assert_eq!(hex(0, &mut buf), "0x0");
        assert_eq!(hex(0xdeadbeef, &mut buf), "0xdeadbeef");
        assert_eq!(hex(usize::MAX, &mut buf), "0xffffffffffffffff");
    }
}
