//! Extract functions - unpack downloaded archives into the exports directory

use crate::ingestion::error::ExtractError;
use crate::ingestion::types::FileId;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::result::ZipError;

/// Unpack a single-file archive into `work_dir` as `<file_id>_<entry name>`.
///
/// The bytes go to a temporary archive next to the output, which is removed
/// on every path out of this function. The archive must hold exactly one
/// file; anything else is a corrupt archive. The file id prefix keeps files
/// of different descriptors apart when their archives use the same entry name.
pub fn extract_single_file(
    bytes: &[u8],
    work_dir: &Path,
    file_id: &FileId,
) -> Result<PathBuf, ExtractError> {
    fs::create_dir_all(work_dir)?;

    let mut temp = tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".zip")
        .tempfile_in(work_dir)?;
    temp.write_all(bytes)?;
    temp.flush()?;
    info!("Saved {} byte archive to {:?}", bytes.len(), temp.path());

    let mut archive = zip::ZipArchive::new(temp.reopen()?).map_err(corrupt)?;

    let mut file_entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(corrupt)?;
        if !entry.is_dir() {
            file_entries.push(i);
        }
    }

    let index = match file_entries.as_slice() {
        [index] => *index,
        [] => return Err(ExtractError::CorruptArchive("archive contains no files".to_string())),
        many => {
            return Err(ExtractError::CorruptArchive(format!(
                "archive contains {} files, expected 1",
                many.len()
            )))
        }
    };

    let mut entry = archive.by_index(index).map_err(corrupt)?;
    let file_name = entry
        .enclosed_name()
        .and_then(|p| p.file_name().map(|n| n.to_os_string()))
        .ok_or_else(|| {
            ExtractError::CorruptArchive(format!("unsafe entry name {:?}", entry.name()))
        })?;

    let mut output_name = working_prefix(file_id).into_os_string();
    output_name.push(&file_name);
    let output_path = work_dir.join(output_name);
    let mut output = fs::File::create(&output_path)?;

    if let Err(e) = io::copy(&mut entry, &mut output).and_then(|_| output.flush()) {
        drop(output);
        if let Err(cleanup) = fs::remove_file(&output_path) {
            warn!("Failed to remove partial file {:?}: {}", output_path, cleanup);
        }
        // Bad deflate streams and checksum mismatches surface as I/O errors
        return Err(match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
                ExtractError::CorruptArchive(e.to_string())
            }
            _ => ExtractError::Io(e),
        });
    }

    info!("Extracted {:?}", output_path);
    Ok(output_path)
}

/// `<file_id>_` with anything outside `[A-Za-z0-9-]` replaced by `-`
pub fn working_prefix(file_id: &FileId) -> PathBuf {
    let safe: String = file_id
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    PathBuf::from(format!("{}_", safe))
}

fn corrupt(err: ZipError) -> ExtractError {
    match err {
        ZipError::Io(e) if e.kind() != io::ErrorKind::InvalidData => ExtractError::Io(e),
        other => ExtractError::CorruptArchive(other.to_string()),
    }
}
