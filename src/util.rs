use std::io;

/// fs2's `lock_exclusive` on Unix is a thin wrapper around `flock(2)`, and in
/// particular doesn't handle `EINTR` -- a signal arriving while we're blocked
/// waiting for the lock makes the call fail instead of resuming. Retry until
/// we get a real answer.
pub(crate) fn retry_interrupted<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}
