use crate::maildir::CUR;
use anyhow::{anyhow, Context, Result};
use std::fs::DirBuilder;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Sibling of `cur` that receives rewritten messages.
pub const RESCAN_DIR: &str = "rescan";

/// Where the rewritten copy of `source` goes: `<folder>/cur/N` becomes `<folder>/rescan/N`.
pub fn output_path(source: &Path) -> Result<PathBuf> {
    let file_name = source
        .file_name()
        .ok_or_else(|| anyhow!("no file name in {}", source.display()))?;
    let dir = source
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {}", source.display()))?;
    if dir.file_name().and_then(|name| name.to_str()) != Some(CUR) {
        return Err(anyhow!(
            "parent of {} is not a '{CUR}' directory",
            source.display()
        ));
    }
    let folder = dir
        .parent()
        .ok_or_else(|| anyhow!("no folder above {}", dir.display()))?;
    Ok(folder.join(RESCAN_DIR).join(file_name))
}

/// Write `content` to `path`, creating the directory on demand.
///
/// The data goes to a temporary file beside the target first, so the target
/// either holds the complete message or does not exist.
pub fn write_message(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {}", path.display()))?;
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .with_context(|| format!("failed creating output directory {}", dir.display()))?;

    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed creating temporary file in {}", dir.display()))?;
    file.write_all(content)
        .context("failed writing rewritten message")?;
    file.as_file()
        .sync_all()
        .with_context(|| format!("failed syncing temporary file in {}", dir.display()))?;
    file.persist(path)
        .map_err(|e| anyhow!("failed renaming into {}: {}", path.display(), e.error))?;

    log::debug!("Wrote {} bytes to {}", content.len(), path.display());
    Ok(())
}
