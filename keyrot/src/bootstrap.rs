/// Process hardening applied before the admin key is loaded.
///
/// Call from `main` while the process is still single-threaded, before the
/// async runtime starts.  Best-effort: failures are logged and the run continues.
///
/// 1. **`PR_SET_DUMPABLE 0`**: no core dumps, no `/proc/<pid>/mem` reads by
///    other unprivileged processes, so the decoded admin key cannot leak
///    through a crash dump.
/// 2. **`mlockall(MCL_CURRENT | MCL_FUTURE)`**: keeps key material out of
///    swap.  Needs `CAP_IPC_LOCK`; without it a warning is logged.
#[cfg(target_os = "linux")]
pub fn secure_bootstrap() {
    set_not_dumpable();
    lock_memory();
}

#[cfg(not(target_os = "linux"))]
pub fn secure_bootstrap() {}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: prctl with PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

#[cfg(target_os = "linux")]
fn lock_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::debug!("mlockall(MCL_CURRENT|MCL_FUTURE): memory locked");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("mlockall failed (non-fatal, key material may be swapped): {err}");
    }
}
