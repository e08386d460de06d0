//! Filesystem-backed collaborators for `keyrot`.
//!
//! - [`FileRosterSource`] reads the roster file as raw bytes.
//! - [`FileKeySource`] looks up `<directory>/<account_id>/<file_template>`.
//! - [`FileIdentitySource`] loads the admin private key, optionally from a
//!   JSON secret document.

pub mod identity;
pub mod keys;
pub mod roster;

pub use identity::FileIdentitySource;
pub use keys::FileKeySource;
pub use roster::FileRosterSource;

/// Warn when `path` is accessible by group or others.  Returns whether it
/// was; an unreadable path is logged and reported as not exposed.
#[cfg(unix)]
pub fn warn_if_exposed(path: &std::path::Path, what: &str) -> bool {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.mode();
            let exposed = mode & 0o077 != 0;
            if exposed {
                tracing::warn!(
                    path = %path.display(),
                    mode = %format!("{:o}", mode & 0o777),
                    "{what} is accessible by group or others; recommend: chmod 600 {}",
                    path.display()
                );
            }
            exposed
        }
        Err(e) => {
            tracing::warn!("could not check {what} permissions: {e}");
            false
        }
    }
}

#[cfg(not(unix))]
pub fn warn_if_exposed(_path: &std::path::Path, _what: &str) -> bool {
    false
}
