use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// Size at which the log file is cut back on startup.
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;
/// Lines kept by a rotation.
pub const ROTATE_KEEP_LINES: usize = 1000;
/// Lines kept by an operator flush.
pub const FLUSH_KEEP_LINES: usize = 50;
/// How far from the end of the file tails are read.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Cuts the file down to its last [`ROTATE_KEEP_LINES`] lines once it reaches
/// [`MAX_LOG_SIZE`]. Returns whether the file was rewritten.
pub fn rotate_if_needed(path: &Path) -> io::Result<bool> {
    let size = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if size < MAX_LOG_SIZE {
        return Ok(false);
    }

    let lines = read_last_lines(path, ROTATE_KEEP_LINES)?;
    if lines.is_empty() {
        return Ok(false);
    }
    fs::write(path, join_lines(&lines))?;
    Ok(true)
}

/// Rewrites the file with only its last `keep` lines.
pub fn truncate_to_last(path: &Path, keep: usize) -> io::Result<()> {
    let lines = match read_last_lines(path, keep) {
        Ok(lines) => lines,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e),
    };
    fs::write(path, join_lines(&lines))
}

/// Reads the last `n` lines from the final 64 KiB of the file.
///
/// When the window starts mid-file its first, possibly partial, line is dropped.
pub fn read_last_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size == 0 || n == 0 {
        return Ok(Vec::new());
    }

    let window = size.min(TAIL_WINDOW);
    file.seek(SeekFrom::Start(size - window))?;
    let mut buf = Vec::with_capacity(window as usize);
    file.take(window).read_to_end(&mut buf)?;

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.split('\n').collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    if size > window && !lines.is_empty() {
        lines.remove(0);
    }

    let start = lines.len().saturating_sub(n);
    Ok(lines[start..]
        .iter()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect())
}

pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn join_lines(lines: &[String]) -> String {
    if lines.is_empty() {
        return String::new();
    }
    let mut content = lines.join("\n");
    content.push('\n');
    content
}
