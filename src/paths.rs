//! On-disk layout of the cache directory.
//!
//! An entry for digest `d` lives at `<root>/<hex(d[31])>/<hex(d[30])>/<hex(d)>`.
//! The two trailing digest bytes spread entries over at most 256 × 256
//! subdirectories. During creation a sibling `<path>.tmp` transiently exists.

use std::path::{Path, PathBuf};

use crate::key::{Digest, DIGEST_LEN};

/// Returns the two-level directory and the full file path for a digest.
pub(crate) fn entry_paths(root: &Path, digest: &Digest) -> (PathBuf, PathBuf) {
    let dir = root
        .join(format!("{:02x}", digest.0[DIGEST_LEN - 1]))
        .join(format!("{:02x}", digest.0[DIGEST_LEN - 2]));
    let path = dir.join(digest.file_name());
    (dir, path)
}

/// Returns the sibling temporary path an entry is written to before rename.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
