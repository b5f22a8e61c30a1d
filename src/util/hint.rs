/// Run `f` on a path the compiler should treat as unlikely
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
