use std::fs;
use std::io;
use std::path::Path;

/// Writes to a sibling temporary file and renames it over `path`, so `path`
/// either does not exist or holds the complete contents.
pub fn write_atomically(path: &Path, contents: &[u8], mode: u32) -> io::Result<()> {
    let mut file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
        .to_os_string();
    file_name.push(format!(".{}.tmp", std::process::id()));
    let temporary = path.with_file_name(file_name);

    let written = fs::write(&temporary, contents)
        .and_then(|()| set_mode(&temporary, mode))
        .and_then(|()| fs::rename(&temporary, path));
    if written.is_err() {
        let _ = fs::remove_file(&temporary);
    }
    written
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
