//! Step outputs.
//!
//! Outputs are printed as `name=value` lines on stdout and, when
//! `GITHUB_OUTPUT` names a file, appended to it as well.

use std::io::Write;
use std::path::Path;

/// Environment variable naming the step output file.
pub const OUTPUT_FILE_ENV: &str = "GITHUB_OUTPUT";

/// Format a single output line.
pub fn format_output(name: &str, value: &str) -> String {
    format!("{name}={value}")
}

/// Emit an output to stdout and the step output file, if any.
pub fn set_output(name: &str, value: &str) -> Result<(), std::io::Error> {
    let line = format_output(name, value);
    println!("{line}");
    if let Some(path) = std::env::var_os(OUTPUT_FILE_ENV).filter(|p| !p.is_empty()) {
        append_line(Path::new(&path), &line)?;
    }
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<(), std::io::Error> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}
