//! 用户凭据文件：注册与校验。
//!
//! 每行一个用户：`username:salt:sha256(salt || password)`，盐与摘要均为小写十六进制。

use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, ErrorKind};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::MAX_USERNAME_LEN;

#[derive(Debug)]
pub enum UserStoreError {
    InvalidUsername,
    EmptyPassword,
    AlreadyExists,
    Io(io::Error),
}

impl From<io::Error> for UserStoreError {
    fn from(err: io::Error) -> Self {
        UserStoreError::Io(err)
    }
}

#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

struct UserRecord<'a> {
    username: &'a str,
    salt: &'a str,
    digest: &'a str,
}

impl UserStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// 注册新用户；用户名已存在时返回 `AlreadyExists`。
    pub async fn register(&self, username: &str, password: &str) -> Result<(), UserStoreError> {
        if !is_valid_username(username) {
            return Err(UserStoreError::InvalidUsername);
        }
        if password.is_empty() {
            return Err(UserStoreError::EmptyPassword);
        }

        let _guard = self.write_lock.lock().await;
        let contents = self.read_contents().await?;
        if parse_records(&contents).any(|record| record.username == username) {
            return Err(UserStoreError::AlreadyExists);
        }

        let salt = Uuid::new_v4().simple().to_string();
        let line = format!("{username}:{salt}:{}\n", hash_password(&salt, password));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// 校验用户名与密码。
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<bool, UserStoreError> {
        let contents = self.read_contents().await?;
        let matched = parse_records(&contents)
            .find(|record| record.username == username)
            .is_some_and(|record| hash_password(record.salt, password) == record.digest);
        Ok(matched)
    }

    async fn read_contents(&self) -> Result<String, UserStoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(UserStoreError::Io(err)),
        }
    }
}

fn parse_records(contents: &str) -> impl Iterator<Item = UserRecord<'_>> {
    contents.lines().filter_map(|line| {
        let mut fields = line.trim_end().splitn(3, ':');
        let username = fields.next()?;
        let salt = fields.next()?;
        let digest = fields.next()?;
        Some(UserRecord {
            username,
            salt,
            digest,
        })
    })
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 用户名同时用作目录名，只允许安全字符。
pub fn is_valid_username(username: &str) -> bool {
    !username.is_empty()
        && username.len() <= MAX_USERNAME_LEN
        && !username.starts_with('.')
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
