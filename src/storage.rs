//! 按用户隔离的文件存储与路径解析。

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs;
use tokio::io::ErrorKind;

use crate::atomic::{TEMP_PREFIX, write_atomic};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub async fn ensure_user_root(&self, username: &str) -> io::Result<()> {
        fs::create_dir_all(self.root.join(username)).await
    }

    fn user_root(&self, username: &str) -> PathBuf {
        self.root.join(username)
    }

    /// 将用户相对路径解析为磁盘路径，并拒绝越界与符号链接。
    pub async fn resolve_user_path(
        &self,
        username: &str,
        relative: &str,
        allow_missing_leaf: bool,
    ) -> Result<PathBuf, StorageError> {
        let user_root = self.user_root(username);
        let target = resolve(&user_root, relative)?;
        ensure_no_symlink_components(&user_root, &target, allow_missing_leaf).await?;
        Ok(target)
    }

    /// 列出用户目录内容：目录在前，按名称不区分大小写排序。
    pub async fn list_dir(
        &self,
        username: &str,
        relative: &str,
    ) -> Result<Vec<FileEntry>, StorageError> {
        let target = self.resolve_user_path(username, relative, false).await?;
        if !fs::metadata(&target).await?.is_dir() {
            return Err(StorageError::InvalidPath);
        }
        let mut dir = fs::read_dir(&target).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified = metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(format_timestamp);

            entries.push(FileEntry {
                name,
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified,
            });
        }

        entries.sort_by(|a, b| match (a.is_dir, b.is_dir) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    /// 原子写入 `dir/name`，目录不存在时一并创建；同名目录已存在时拒绝。
    pub async fn write_file(
        &self,
        username: &str,
        dir: &str,
        name: &str,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        validate_entry_name(name)?;
        let parent = self.resolve_user_path(username, dir, true).await?;
        fs::create_dir_all(&parent).await?;
        let target = parent.join(name);
        ensure_not_symlink(&target).await?;
        if fs::metadata(&target).await.is_ok_and(|metadata| metadata.is_dir()) {
            return Err(StorageError::Occupied);
        }

        write_atomic(&target, data).await?;
        Ok(target)
    }

    pub async fn delete_file(
        &self,
        username: &str,
        dir: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        validate_entry_name(name)?;
        let target = self.resolve_entry(username, dir, name).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            return Err(StorageError::InvalidPath);
        }
        fs::remove_file(target).await?;
        Ok(())
    }

    pub async fn create_dir(
        &self,
        username: &str,
        dir: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        validate_entry_name(name)?;
        let parent = self.resolve_user_path(username, dir, true).await?;
        let target = parent.join(name);
        ensure_not_symlink(&target).await?;
        fs::create_dir_all(target).await?;
        Ok(())
    }

    /// 递归删除目录。
    pub async fn delete_dir(
        &self,
        username: &str,
        dir: &str,
        name: &str,
    ) -> Result<(), StorageError> {
        validate_entry_name(name)?;
        let target = self.resolve_entry(username, dir, name).await?;
        let metadata = fs::metadata(&target).await?;
        if !metadata.is_dir() {
            return Err(StorageError::InvalidPath);
        }
        fs::remove_dir_all(target).await?;
        Ok(())
    }

    async fn resolve_entry(
        &self,
        username: &str,
        dir: &str,
        name: &str,
    ) -> Result<PathBuf, StorageError> {
        let joined = format!("{}/{}", dir.trim_end_matches(['/', '\\']), name);
        self.resolve_user_path(username, &joined, false).await
    }
}

fn resolve(base: &Path, relative: &str) -> Result<PathBuf, StorageError> {
    let mut normalized = PathBuf::new();
    let trimmed = relative.trim_start_matches(['/', '\\']);
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(segment) => normalized.push(segment),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidPath);
            }
        }
    }
    Ok(base.join(normalized))
}

async fn ensure_no_symlink_components(
    base: &Path,
    target: &Path,
    allow_missing_leaf: bool,
) -> Result<(), StorageError> {
    let relative = target
        .strip_prefix(base)
        .map_err(|_| StorageError::InvalidPath)?;
    let mut current = base.to_path_buf();
    let mut components = relative.components().peekable();

    while let Some(component) = components.next() {
        current.push(component.as_os_str());
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() {
                    return Err(StorageError::InvalidPath);
                }
                if components.peek().is_some() && !metadata.is_dir() {
                    return Err(StorageError::InvalidPath);
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                return Ok(());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
    }

    Ok(())
}

async fn ensure_not_symlink(path: &Path) -> Result<(), StorageError> {
    match fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.file_type().is_symlink() => Err(StorageError::InvalidPath),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StorageError::Io(err)),
    }
}

/// 将目录参数规整为 `/`、`/a/`、`/a/b/` 形式；含 `..` 时拒绝。
pub fn normalize_dir(raw: &str) -> Result<String, StorageError> {
    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(StorageError::InvalidPath),
            other if other.contains('\0') => return Err(StorageError::InvalidPath),
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}/", segments.join("/")))
}

/// 规整后目录的上一级，根目录返回 `None`。
pub fn parent_dir(dir: &str) -> Option<String> {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let cut = trimmed.rfind('/').unwrap_or(0);
    Some(format!("{}/", &trimmed[..cut]))
}

/// 校验单个文件/目录名，拒绝任何可能越界的名称。
pub fn validate_entry_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidName);
    }
    Ok(())
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    InvalidName,
    /// 目标名称已被目录占用。
    Occupied,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[derive(Debug)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<String>,
}
