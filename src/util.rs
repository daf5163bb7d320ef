use anyhow::{format_err, Result};
use rand::{distributions::Alphanumeric, prelude::*};
use std::{io::ErrorKind, path::Path, path::PathBuf};
use tokio::fs::File;

/// Creates a uniquely-named temp file under `dir`, retrying on name collisions. Used by
/// `JsonFileStore` for its atomic write-then-rename pattern.
pub async fn tempfile(dir: impl AsRef<Path>) -> Result<(PathBuf, File)> {
    const TEMP_PREFIX: &str = "tmpfile_";
    const RAND_LEN: usize = 10;
    const RETRIES: usize = 4;

    for _ in 0..RETRIES {
        let mut tempname = String::with_capacity(TEMP_PREFIX.len() + RAND_LEN);
        tempname.push_str(TEMP_PREFIX);
        tempname.extend(
            thread_rng()
                .sample_iter(Alphanumeric)
                .take(RAND_LEN)
                .map(char::from),
        );

        let mut path = dir.as_ref().to_owned();
        path.push(tempname);
        match File::create(&path).await {
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            file => return Ok((path, file?)),
        };
    }
    Err(format_err!("Failed to create tempfile"))
}
