//! Resume position persisted between runs of a sequencing process.
//!
//! A text file holding the insertion time of the last product handled,
//! preceded by `#` comment lines.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::timestamp::Timestamp;
use crate::{Error, Result};

const HEADER: &str = "\
# The following is the insertion-time of the last data-product that was
# successfully processed. It is used to resume from the same point after a
# restart. Do not edit while the process that wrote it is running.
";

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn read(path: &Path) -> Result<Timestamp> {
    let text = std::fs::read_to_string(path)?;
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .ok_or(Error::Invalid("checkpoint file holds no timestamp"))?;
    line.parse()
}

pub fn write(path: &Path, time: Timestamp) -> Result<()> {
    let tmp = tmp_path(path);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    writeln!(file, "{HEADER}{time}")?;
    file.sync_all()?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
