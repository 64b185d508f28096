//! Dataset file rotation.
//!
//! The current dataset lives in the data directory as
//! `base_atual_DD-MM-YYYY.xlsx`; previous datasets are kept as
//! `backup_DD-MM-YYYY.xlsx`. This module owns the naming rules, the
//! "which file is current" decision and the crash-safe promotion of a
//! freshly imported upload.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;

/// Prefix of the current dataset file.
pub const CURRENT_PREFIX: &str = "base_atual_";
/// Prefix of backup files. A backup is never eligible as current.
pub const BACKUP_PREFIX: &str = "backup_";
/// How many backups are retained after a rotation.
pub const BACKUP_KEEP: usize = 3;

const XLSX_EXT: &str = ".xlsx";

/// Formats a date the way file names carry it, `DD-MM-YYYY`.
pub fn date_stamp(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

/// Whether a file name matches the current dataset pattern.
pub fn is_current_name(name: &str) -> bool {
    name.starts_with(CURRENT_PREFIX) && name.ends_with(XLSX_EXT)
}

/// Whether a file name matches the backup pattern.
pub fn is_backup_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX) && name.ends_with(XLSX_EXT)
}

fn entries_matching(dir: &Path, pred: fn(&str) -> bool) -> Vec<(PathBuf, SystemTime)> {
    let mut found = Vec::new();
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) => {
            log::warn!("Cannot read data directory {:?}: {}", dir, e);
            return found;
        }
    };
    for entry in read.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !pred(name) {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((entry.path(), mtime));
    }
    found
}

/// Picks the current dataset file: the most recently modified file matching
/// the current pattern. Backups never qualify, whatever their mtime.
///
/// Returns `None` when the directory has no current file (or cannot be
/// read), which callers treat as "no dataset".
pub fn select_current(dir: &Path) -> Option<PathBuf> {
    entries_matching(dir, is_current_name)
        .into_iter()
        .max_by_key(|(_, mtime)| *mtime)
        .map(|(path, _)| path)
}

/// Last-modified time of the current dataset file, if any.
pub fn current_mtime(dir: &Path) -> Option<SystemTime> {
    let path = select_current(dir)?;
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Moves a file, falling back to copy-then-delete when rename fails
/// (different filesystems, or Windows holding the source open).
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            log::warn!(
                "Rename {:?} -> {:?} failed ({}), copying instead",
                from,
                to,
                rename_err
            );
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
    }
}

/// Promotes a freshly imported upload to be the current dataset.
///
/// The previous current file (if any) becomes `backup_<today>.xlsx`; every
/// other file matching the current pattern is removed so exactly one
/// current file remains; backups beyond [`BACKUP_KEEP`] are pruned, oldest
/// first. A failed backup step is logged and skipped, but a failure moving
/// the upload into place is fatal and leaves the upload untouched.
pub fn rotate(dir: &Path, upload: &Path, today: NaiveDate) -> io::Result<PathBuf> {
    let stamp = date_stamp(today);

    if let Some(previous) = select_current(dir) {
        let backup = dir.join(format!("{}{}{}", BACKUP_PREFIX, stamp, XLSX_EXT));
        if let Err(e) = move_file(&previous, &backup) {
            log::warn!("Backup of {:?} failed: {}", previous, e);
        } else {
            log::info!("Previous dataset backed up as {:?}", backup);
        }
    }

    // Sweep leftovers from interrupted rotations so the "exactly one
    // current file" invariant holds after this call.
    for (stale, _) in entries_matching(dir, is_current_name) {
        if let Err(e) = fs::remove_file(&stale) {
            log::warn!("Cannot remove stale dataset file {:?}: {}", stale, e);
        }
    }

    let target = dir.join(format!("{}{}{}", CURRENT_PREFIX, stamp, XLSX_EXT));
    move_file(upload, &target)?;
    log::info!("New dataset in place at {:?}", target);

    prune_backups(dir);
    Ok(target)
}

/// Removes backups beyond the retention count, oldest first.
fn prune_backups(dir: &Path) {
    let mut backups = entries_matching(dir, is_backup_name);
    if backups.len() <= BACKUP_KEEP {
        return;
    }
    // Newest first; everything past the keep window goes.
    backups.sort_by(|a, b| b.1.cmp(&a.1));
    for (old, _) in backups.drain(BACKUP_KEEP..) {
        match fs::remove_file(&old) {
            Ok(()) => log::info!("Pruned old backup {:?}", old),
            Err(e) => log::warn!("Cannot prune backup {:?}: {}", old, e),
        }
    }
}

/// Deletes every file matching the current pattern. Backups are untouched.
/// Returns how many files were removed.
pub fn delete_current_files(dir: &Path) -> usize {
    let mut deleted = 0;
    for (path, _) in entries_matching(dir, is_current_name) {
        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Deleted dataset file {:?}", path);
                deleted += 1;
            }
            Err(e) => log::warn!("Cannot delete dataset file {:?}: {}", path, e),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(b"x").unwrap();
        let mtime = SystemTime::now() - Duration::from_secs(age_secs);
        file.set_modified(mtime).unwrap();
        path
    }

    #[test]
    fn name_patterns() {
        assert!(is_current_name("base_atual_15-01-2024.xlsx"));
        assert!(!is_current_name("backup_15-01-2024.xlsx"));
        assert!(!is_current_name("base_atual_15-01-2024.xls"));
        assert!(is_backup_name("backup_15-01-2024.xlsx"));
        assert!(!is_backup_name("notes.txt"));
    }

    #[test]
    fn empty_dir_has_no_current() {
        let dir = tempdir().unwrap();
        assert_eq!(select_current(dir.path()), None);
    }

    #[test]
    fn newest_current_wins() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "base_atual_01-01-2024.xlsx", 3600);
        let newer = touch(dir.path(), "base_atual_02-01-2024.xlsx", 60);
        assert_eq!(select_current(dir.path()), Some(newer));
    }

    #[test]
    fn backups_never_selected_even_when_newer() {
        let dir = tempdir().unwrap();
        let current = touch(dir.path(), "base_atual_01-01-2024.xlsx", 3600);
        touch(dir.path(), "backup_02-01-2024.xlsx", 10);
        assert_eq!(select_current(dir.path()), Some(current));
    }

    #[test]
    fn rotate_leaves_exactly_one_current_and_a_backup() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "base_atual_01-01-2024.xlsx", 3600);
        touch(dir.path(), "base_atual_05-01-2024.xlsx", 1800);
        let upload = touch(dir.path(), "temp-upload.xlsx", 0);

        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let target = rotate(dir.path(), &upload, today).unwrap();

        assert_eq!(
            target.file_name().unwrap().to_str().unwrap(),
            "base_atual_15-01-2024.xlsx"
        );
        assert!(!upload.exists());

        let currents = entries_matching(dir.path(), is_current_name);
        assert_eq!(currents.len(), 1);
        let backups = entries_matching(dir.path(), is_backup_name);
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn rotate_without_previous_dataset() {
        let dir = tempdir().unwrap();
        let upload = touch(dir.path(), "temp-upload.xlsx", 0);
        let today = NaiveDate::from_ymd_opt(2024, 2, 2).unwrap();
        rotate(dir.path(), &upload, today).unwrap();

        assert_eq!(entries_matching(dir.path(), is_current_name).len(), 1);
        assert_eq!(entries_matching(dir.path(), is_backup_name).len(), 0);
    }

    #[test]
    fn prune_keeps_three_newest_backups() {
        let dir = tempdir().unwrap();
        for (i, age) in [5000u64, 4000, 3000, 2000, 1000].iter().enumerate() {
            touch(dir.path(), &format!("backup_0{}-01-2024.xlsx", i + 1), *age);
        }
        touch(dir.path(), "base_atual_09-01-2024.xlsx", 600);
        let upload = touch(dir.path(), "temp-upload.xlsx", 0);

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        rotate(dir.path(), &upload, today).unwrap();

        let backups = entries_matching(dir.path(), is_backup_name);
        assert_eq!(backups.len(), BACKUP_KEEP);
        // The two oldest must be gone.
        assert!(!dir.path().join("backup_01-01-2024.xlsx").exists());
        assert!(!dir.path().join("backup_02-01-2024.xlsx").exists());
    }

    #[test]
    fn delete_spares_backups() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "base_atual_01-01-2024.xlsx", 100);
        touch(dir.path(), "base_atual_02-01-2024.xlsx", 50);
        let backup = touch(dir.path(), "backup_01-01-2024.xlsx", 10);

        assert_eq!(delete_current_files(dir.path()), 2);
        assert!(backup.exists());
        assert_eq!(select_current(dir.path()), None);
    }

    #[test]
    fn date_stamp_format() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(date_stamp(d), "07-03-2024");
    }
}
