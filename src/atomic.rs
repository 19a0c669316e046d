//! 原子写入：先写同目录临时文件，落盘后 rename 覆盖目标。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 目录列表会跳过此前缀的临时文件。
pub const TEMP_PREFIX: &str = ".upload.";

/// 将 `data` 原子写入 `target`；失败时删除临时文件，目标保持原样。
pub async fn write_atomic(target: &Path, data: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(target)?;
    if let Err(err) = write_and_sync(&temp_path, data).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Some(parent) = target.parent() {
        let _ = sync_dir(parent).await;
    }
    Ok(())
}

fn temp_path_for(target: &Path) -> io::Result<PathBuf> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_else(|| "file".into());
    Ok(parent.join(format!("{TEMP_PREFIX}{base}.{}", Uuid::new_v4().simple())))
}

async fn write_and_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.sync_all().await
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::File::open(path)?.sync_all())
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
}
