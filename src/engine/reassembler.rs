// Joins the parts of one image file and moves the result into the delivery directory.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::block_store::AssemblyRun;
use crate::config::CONCAT_CHUNK_SIZE;
use crate::error::Result;
use crate::source::messages::ImageAddress;

pub struct Reassembler {
    delivery_dir: PathBuf,
    chunk_size: usize,
}

impl Reassembler {
    pub fn new(delivery_dir: PathBuf) -> Self {
        Self {
            delivery_dir,
            chunk_size: CONCAT_CHUNK_SIZE,
        }
    }

    /// `<yyyyMMdd-HHmmss>-<sheet>-<image>-<part>.pdf`, named after the file's first part.
    pub fn file_name(address: &ImageAddress, at: DateTime<Local>) -> String {
        format!(
            "{}-{}-{}-{}.pdf",
            at.format("%Y%m%d-%H%M%S"),
            address.sheet_number,
            address.image_number,
            address.image_part
        )
    }

    /// Build the final file for `run` and return its path.
    ///
    /// The first part's scratch file is moved into place and later parts are
    /// appended in block order, each source being deleted once copied. On
    /// failure the partial output and every remaining scratch file of the run
    /// are removed as well.
    pub async fn assemble(&self, run: &AssemblyRun) -> Result<PathBuf> {
        let dest = match self.destination(run).await {
            Ok(dest) => dest,
            Err(e) => {
                remove_parts(run).await;
                return Err(e);
            }
        };
        if let Err(e) = self.concatenate(run, &dest).await {
            if fs::try_exists(&dest).await.unwrap_or(false) {
                if let Err(rm) = fs::remove_file(&dest).await {
                    warn!("removing partial file {} failed: {}", dest.display(), rm);
                }
            }
            remove_parts(run).await;
            return Err(e);
        }
        Ok(dest)
    }

    async fn destination(&self, run: &AssemblyRun) -> Result<PathBuf> {
        fs::create_dir_all(&self.delivery_dir).await?;
        let name = Self::file_name(&run.first().metadata.address, Local::now());
        self.unique_destination(&name).await
    }

    async fn concatenate(&self, run: &AssemblyRun, dest: &Path) -> Result<()> {
        move_file(&run.first().path, dest).await?;

        if run.parts.len() > 1 {
            let mut out = OpenOptions::new().append(true).open(dest).await?;
            let mut buf = vec![0u8; self.chunk_size];
            for part in &run.parts[1..] {
                let mut input = File::open(&part.path).await?;
                let mut copied = 0u64;
                loop {
                    let n = input.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    out.write_all(&buf[..n]).await?;
                    copied += n as u64;
                }
                drop(input);
                fs::remove_file(&part.path).await?;
                debug!("appended block {} ({} bytes) to {}", part.block, copied, dest.display());
            }
            out.flush().await?;
        }
        Ok(())
    }

    async fn unique_destination(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.delivery_dir.join(name);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
        let stem = name.trim_end_matches(".pdf");
        let mut n = 1u32;
        loop {
            let candidate = self.delivery_dir.join(format!("{}-{}.pdf", stem, n));
            if !fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }
}

async fn remove_parts(run: &AssemblyRun) {
    for part in &run.parts {
        if fs::try_exists(&part.path).await.unwrap_or(false) {
            let _ = fs::remove_file(&part.path).await;
        }
    }
}

/// Rename, falling back to copy + delete when the directories sit on different filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Err(e) = fs::rename(from, to).await {
        warn!("rename {} failed ({}), copying instead", from.display(), e);
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::block_store::DownloadedBlock;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn part(dir: &Path, block: u64, more_parts: &str, payload: &[u8]) -> DownloadedBlock {
        let path = dir.join(format!("{}.part", block));
        std::fs::write(&path, payload).unwrap();
        let raw = format!(
            r#"{{"address": {{"moreParts": "{}", "sheetNumber": 2, "imageNumber": 3, "imagePart": 1}}}}"#,
            more_parts
        );
        DownloadedBlock {
            block,
            metadata: serde_json::from_str(&raw).unwrap(),
            metadata_raw: Bytes::from(raw),
            path,
            size: payload.len() as u64,
        }
    }

    #[test]
    fn test_file_name() {
        let raw = r#"{"moreParts": "lastPartInFile", "sheetNumber": 4, "imageNumber": 7, "imagePart": 1}"#;
        let address: ImageAddress = serde_json::from_str(raw).unwrap();
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 59).unwrap();
        assert_eq!(Reassembler::file_name(&address, at), "20240309-140559-4-7-1.pdf");
    }

    #[tokio::test]
    async fn test_single_part_is_moved() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let run = AssemblyRun {
            parts: vec![part(scratch.path(), 1, "lastPartInFile", b"only")],
        };

        let path = Reassembler::new(out.path().to_path_buf()).assemble(&run).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"only");
        assert!(path.starts_with(out.path()));
        assert!(!run.parts[0].path.exists());
    }

    #[tokio::test]
    async fn test_parts_are_concatenated_in_order() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let run = AssemblyRun {
            parts: vec![
                part(scratch.path(), 4, "morePartsPending", b"one-"),
                part(scratch.path(), 5, "morePartsPending", b"two-"),
                part(scratch.path(), 6, "lastPartInFile", b"three"),
            ],
        };

        let mut reassembler = Reassembler::new(out.path().to_path_buf());
        reassembler.chunk_size = 2;
        let path = reassembler.assemble(&run).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one-two-three");
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_part_cleans_up_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let first = part(scratch.path(), 1, "morePartsPending", b"a");
        let mut second = part(scratch.path(), 2, "morePartsPending", b"b");
        let third = part(scratch.path(), 3, "lastPartInFile", b"c");
        std::fs::remove_file(&second.path).unwrap();
        second.path = scratch.path().join("gone.part");

        let run = AssemblyRun {
            parts: vec![first, second, third],
        };
        assert!(Reassembler::new(out.path().to_path_buf()).assemble(&run).await.is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_unusable_delivery_dir_cleans_up_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let blocked = out.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();
        let run = AssemblyRun {
            parts: vec![part(scratch.path(), 1, "lastPartInFile", b"a")],
        };

        assert!(Reassembler::new(blocked.clone()).assemble(&run).await.is_err());
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
        assert_eq!(std::fs::read(&blocked).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_name_collision_gets_suffix() {
        let scratch = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let reassembler = Reassembler::new(out.path().to_path_buf());

        let a = AssemblyRun {
            parts: vec![part(scratch.path(), 1, "lastPartInFile", b"a")],
        };
        let b = AssemblyRun {
            parts: vec![part(scratch.path(), 2, "lastPartInFile", b"b")],
        };
        let pa = reassembler.assemble(&a).await.unwrap();
        let pb = reassembler.assemble(&b).await.unwrap();
        assert_ne!(pa, pb);
        assert_eq!(std::fs::read(&pb).unwrap(), b"b");
    }
}
