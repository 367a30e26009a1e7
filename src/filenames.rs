//! Database file naming.
//!
//! Everything in a database directory is one of:
//!
//! - `LOCK` — exclusive advisory lock
//! - `CURRENT` — one-line pointer to the live manifest
//! - `MANIFEST-<n>` — append-only log of version edits
//! - `<n>.log` — write-ahead logs
//! - `<n>.ldb` — sorted tables (`<n>.sst` is accepted when reading, for
//!   databases written by older builds)
//! - `<n>.dbtmp` — scratch files, e.g. the staging file for a CURRENT swap

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Lock,
    Current,
    Manifest,
    Log,
    Table,
    Temp,
}

pub fn lock_file_name(db: &Path) -> PathBuf {
    db.join("LOCK")
}

pub fn current_file_name(db: &Path) -> PathBuf {
    db.join("CURRENT")
}

pub fn manifest_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("MANIFEST-{number:06}"))
}

pub fn log_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.log"))
}

pub fn table_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.ldb"))
}

/// Legacy table name, recognized on read only.
pub fn sst_table_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.sst"))
}

pub fn temp_file_name(db: &Path, number: u64) -> PathBuf {
    db.join(format!("{number:06}.dbtmp"))
}

/// Classifies a directory entry name, returning its type and file number
/// (zero for the singleton files). Unrecognized names return `None` and
/// are left alone by garbage collection.
pub fn parse_file_name(name: &str) -> Option<(FileType, u64)> {
    match name {
        "LOCK" => return Some((FileType::Lock, 0)),
        "CURRENT" => return Some((FileType::Current, 0)),
        _ => {}
    }
    if let Some(rest) = name.strip_prefix("MANIFEST-") {
        let number = rest.parse::<u64>().ok()?;
        return Some((FileType::Manifest, number));
    }
    if let Some((digits, suffix)) = name.split_once('.') {
        let number = digits.parse::<u64>().ok()?;
        return match suffix {
            "log" => Some((FileType::Log, number)),
            "ldb" | "sst" => Some((FileType::Table, number)),
            "dbtmp" => Some((FileType::Temp, number)),
            _ => None,
        };
    }
    None
}

/// Points CURRENT at `MANIFEST-<manifest_number>` atomically: the new
/// content is written to a temp file, synced, then renamed over CURRENT.
pub fn set_current_file(db: &Path, manifest_number: u64) -> Result<()> {
    let tmp = temp_file_name(db, manifest_number);
    let contents = format!("MANIFEST-{manifest_number:06}\n");
    let write_tmp = || -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        Ok(())
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, current_file_name(db)) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Reads CURRENT and returns the manifest path it names.
pub fn read_current_file(db: &Path) -> Result<PathBuf> {
    let contents = fs::read_to_string(current_file_name(db))
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("{}: CURRENT", db.display()))
            }
            _ => e.into(),
        })?;
    let name = contents.trim_end_matches('\n');
    if name.is_empty() || contents == name {
        return Err(Error::Corruption(format!(
            "CURRENT file malformed in {}",
            db.display()
        )));
    }
    if parse_file_name(name).map(|(t, _)| t) != Some(FileType::Manifest) {
        return Err(Error::Corruption(format!(
            "CURRENT names a non-manifest file: {name}"
        )));
    }
    Ok(db.join(name))
}
