//! Consistent export of the live SQLite store.
//!
//! The export goes through SQLite's online backup API, which copies a
//! transactionally consistent snapshot while the application keeps reading
//! and writing. The live file is never copied byte for byte.

use crate::utils::errors::Result;
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const PAGES_PER_STEP: std::os::raw::c_int = 256;
const STEP_PAUSE: Duration = Duration::from_millis(25);

/// Copies the store at `source` into a new database file at `dest`.
pub fn export(source: &Path, dest: &Path) -> Result<()> {
    let src = Connection::open_with_flags(
        source,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    src.busy_timeout(Duration::from_secs(30))?;

    if dest.exists() {
        std::fs::remove_file(dest)?;
    }
    let mut dst = Connection::open(dest)?;
    {
        let backup = Backup::new(&src, &mut dst)?;
        backup.run_to_completion(PAGES_PER_STEP, STEP_PAUSE, None)?;
    }
    dst.close().map_err(|(_, e)| e)?;

    debug!(source = %source.display(), dest = %dest.display(), "Store exported");
    Ok(())
}

/// Removes the `-wal`/`-shm` side files of a store so a replaced main file
/// is not combined with a stale journal.
pub fn remove_side_files(database: &Path) -> std::io::Result<()> {
    for suffix in ["-wal", "-shm", "-journal"] {
        let mut name = database.as_os_str().to_os_string();
        name.push(suffix);
        match std::fs::remove_file(&name) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
