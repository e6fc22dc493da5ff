//! Crash-safe file helpers.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreResult;

/// Write `value` as pretty JSON via write-to-temp, fsync, rename.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON file, or `None` if it does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    Ok(Some(serde_json::from_reader(BufReader::new(file))?))
}

/// Open a JSON-lines file for appending, creating it if needed.
pub(crate) fn open_append(path: &Path) -> StoreResult<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Append one JSON line and flush it to disk.
pub(crate) fn append_line<T: Serialize>(file: &mut File, value: &T) -> StoreResult<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Read every complete JSON line, paired with the byte offset just past it.
///
/// Reading stops at the first line that is unterminated, not UTF-8, or not
/// valid JSON (a torn append); everything before it is kept.
pub(crate) fn read_lines<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<(T, u64)>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    let mut buf = Vec::new();
    let mut end = 0u64;
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            tracing::warn!(path = %path.display(), bytes = n, "Dropping unterminated log line");
            break;
        }
        end += n as u64;
        let line = &buf[..n - 1];
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(v) => out.push((v, end)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Dropping unreadable log line");
                break;
            }
        }
    }
    Ok(out)
}

/// Cut a file back to `len` bytes so later appends start on a clean line.
pub(crate) fn truncate(path: &Path, len: u64) -> StoreResult<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() > len {
        file.set_len(len)?;
        file.sync_all()?;
    }
    Ok(())
}
