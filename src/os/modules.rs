//! Address ranges of loaded modules, for forcing sampling of allocations made
//! from particular libraries.
//!
//! Ranges come from `dl_iterate_phdr()`, which needs no allocation, so a
//! refresh can happen in the middle of `malloc()`. Everything about this is
//! advisory: a module that is not loaded (yet, or anymore) simply never
//! matches.

use std::{
    cell::UnsafeCell,
    ffi::{c_int, c_void, CStr},
};

use libc::{dl_iterate_phdr, dl_phdr_info, size_t, PT_LOAD};
use log::debug;

use crate::sync::RawMutex;

/// How many module paths can be watched at once
pub const MAX_WATCHED_MODULES: usize = 16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ModuleRange {
    pub begin: usize,
    pub end: usize,
}

impl ModuleRange {
    pub fn contains(&self, pc: usize) -> bool {
        self.begin <= pc && pc < self.end
    }
}

struct Resolved {
    ranges: [Option<ModuleRange>; MAX_WATCHED_MODULES],
    /// `dlpi_adds + dlpi_subs` as of the last refresh
    generation: u64,
}

/// A set of module paths and (when the module is loaded) the address range
/// each one occupies.
pub struct ModuleWatch {
    paths: Vec<String>,
    lock: RawMutex,
    resolved: UnsafeCell<Resolved>,
}

// SAFETY: `resolved` is only touched with `lock` held
unsafe impl Sync for ModuleWatch {}
unsafe impl Send for ModuleWatch {}

/// Does the loaded object `name` correspond to the configured `path`? Either
/// the whole path matches, or the configured path is a prefix of the file
/// name (so `libfoo.so` matches `/usr/lib/libfoo.so.1`).
pub fn matches_path(name: &[u8], path: &str) -> bool {
    if path.is_empty() || name.is_empty() {
        return false;
    }
    if name == path.as_bytes() {
        return true;
    }
    let file_name = match name.iter().rposition(|&b| b == b'/') {
        Some(slash) => &name[slash + 1..],
        None => name,
    };
    file_name.starts_with(path.as_bytes())
}

struct RefreshCtx<'a> {
    paths: &'a [String],
    resolved: &'a mut Resolved,
    only_generation: bool,
    generation: Option<u64>,
}

unsafe extern "C" fn visit_module(info: *mut dl_phdr_info, _: size_t, data: *mut c_void) -> c_int {
    // SAFETY: `data` is the `RefreshCtx` handed to `dl_iterate_phdr()` by
    // `ModuleWatch::iterate()`, exclusively borrowed for the whole call.
    let ctx = &mut *(data as *mut RefreshCtx);
    let info = &*info;
    if ctx.generation.is_none() {
        ctx.generation = Some((info.dlpi_adds as u64).wrapping_add(info.dlpi_subs as u64));
        if ctx.only_generation {
            return 1;
        }
    }
    if info.dlpi_name.is_null() {
        return 0;
    }
    let name = CStr::from_ptr(info.dlpi_name).to_bytes();
    for (i, path) in ctx.paths.iter().enumerate() {
        if ctx.resolved.ranges[i].is_some() || !matches_path(name, path) {
            continue;
        }
        let mut range: Option<ModuleRange> = None;
        for j in 0..info.dlpi_phnum as usize {
            let phdr = &*info.dlpi_phdr.add(j);
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let begin = (info.dlpi_addr as usize).wrapping_add(phdr.p_vaddr as usize);
            let end = begin.wrapping_add(phdr.p_memsz as usize);
            range = Some(match range {
                Some(r) => ModuleRange {
                    begin: r.begin.min(begin),
                    end: r.end.max(end),
                },
                None => ModuleRange { begin, end },
            });
        }
        ctx.resolved.ranges[i] = range;
    }
    0
}

impl ModuleWatch {
    pub fn new(mut paths: Vec<String>) -> Self {
        paths.retain(|p| !p.is_empty());
        paths.truncate(MAX_WATCHED_MODULES);
        let watch = Self {
            paths,
            lock: RawMutex::new(),
            resolved: UnsafeCell::new(Resolved {
                ranges: [None; MAX_WATCHED_MODULES],
                generation: u64::MAX,
            }),
        };
        if !watch.paths.is_empty() {
            let _guard = watch.lock.scoped();
            // SAFETY: lock held
            unsafe { watch.refresh_locked() };
        }
        watch
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// # Safety
    ///
    /// `self.lock` must be held
    unsafe fn iterate(&self, only_generation: bool) -> Option<u64> {
        let mut ctx = RefreshCtx {
            paths: &self.paths,
            resolved: &mut *self.resolved.get(),
            only_generation,
            generation: None,
        };
        dl_iterate_phdr(Some(visit_module), &mut ctx as *mut RefreshCtx as *mut c_void);
        ctx.generation
    }

    /// Drop every resolved range and look all modules up again.
    ///
    /// # Safety
    ///
    /// `self.lock` must be held
    unsafe fn refresh_locked(&self) {
        let resolved = &mut *self.resolved.get();
        resolved.ranges = [None; MAX_WATCHED_MODULES];
        let generation = self.iterate(false);
        let resolved = &mut *self.resolved.get();
        resolved.generation = generation.unwrap_or(u64::MAX);
        debug!(
            "module watch refreshed: {}/{} modules resolved",
            resolved.ranges.iter().flatten().count(),
            self.paths.len()
        );
    }

    /// Forget every resolved range, they are looked up again on the next miss
    pub fn invalidate(&self) {
        let _guard = self.lock.scoped();
        // SAFETY: lock held
        let resolved = unsafe { &mut *self.resolved.get() };
        resolved.ranges = [None; MAX_WATCHED_MODULES];
        resolved.generation = u64::MAX;
    }

    pub fn resolved_count(&self) -> usize {
        let _guard = self.lock.scoped();
        // SAFETY: lock held
        unsafe { &*self.resolved.get() }.ranges.iter().flatten().count()
    }

    fn any_match(resolved: &Resolved, pcs: &[usize]) -> bool {
        pcs.iter()
            .any(|&pc| resolved.ranges.iter().flatten().any(|r| r.contains(pc)))
    }

    /// Is any of `pcs` inside a watched module? On a miss, if some module is
    /// still unresolved and the set of loaded objects changed since the last
    /// refresh, the ranges are re-resolved once and checked again.
    pub fn contains_any(&self, pcs: &[usize]) -> bool {
        if self.paths.is_empty() || pcs.is_empty() {
            return false;
        }
        let _guard = self.lock.scoped();
        // SAFETY: lock held for the rest of the function
        unsafe {
            if Self::any_match(&*self.resolved.get(), pcs) {
                return true;
            }
            let resolved = &*self.resolved.get();
            let unresolved = resolved.ranges[..self.paths.len()].iter().any(Option::is_none);
            if !unresolved {
                return false;
            }
            let generation = self.iterate(true);
            if generation == Some((*self.resolved.get()).generation) {
                return false;
            }
            self.refresh_locked();
            Self::any_match(&*self.resolved.get(), pcs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_matching() {
        assert!(matches_path(b"/usr/lib/libfoo.so.1", "libfoo.so"));
        assert!(matches_path(b"/usr/lib/libfoo.so.1", "/usr/lib/libfoo.so.1"));
        assert!(matches_path(b"libfoo.so", "libfoo"));
        assert!(!matches_path(b"/usr/lib/libbar.so", "libfoo.so"));
        assert!(!matches_path(b"/usr/lib/libfoo.so", ""));
        assert!(!matches_path(b"", "libfoo.so"));
    }

    #[test]
    fn missing_modules_never_match() {
        let watch = ModuleWatch::new(vec!["libdefinitely-not-loaded.so".to_owned()]);
        assert_eq!(watch.resolved_count(), 0);
        assert!(!watch.contains_any(&[0, 1, usize::MAX, visit_module as usize]));
    }

    #[test]
    fn empty_watch_matches_nothing() {
        let watch = ModuleWatch::new(vec![String::new()]);
        assert!(watch.is_empty());
        assert!(!watch.contains_any(&[visit_module as usize]));
    }

    #[test]
    fn loaded_libc_resolves_and_invalidates() {
        let watch = ModuleWatch::new(vec!["libc.so".to_owned()]);
        if watch.resolved_count() == 0 {
            // statically linked or non-glibc target
            return;
        }
        watch.invalidate();
        assert_eq!(watch.resolved_count(), 0);
        // A miss with an unresolved module re-resolves, since the generation
        // was reset by `invalidate()`
        assert!(!watch.contains_any(&[0]));
        assert_eq!(watch.resolved_count(), 1);
    }

    #[test]
    fn ranges_are_half_open() {
        let r = ModuleRange { begin: 10, end: 20 };
        assert!(r.contains(10));
        assert!(r.contains(19));
        assert!(!r.contains(20));
        assert!(!r.contains(9));
    }
}
