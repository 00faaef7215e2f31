// 该文件是 Shouye （守夜） 项目的一部分。
// src/output/folder_notify.rs - 目录通知记录输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{Datelike, Utc};
use thiserror::Error;

use crate::output::{NotificationRecord, Notify};
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum FolderNotifyError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 目录通知记录输出
///
/// 把每条通知记录写成一个 JSON 文件，按 年/月/日 分目录，
/// 文件名带时分秒和递增序号。
pub struct FolderNotify {
  directory: PathBuf,
  record_counter: Arc<Mutex<u16>>,
}

impl FromUrlWithScheme for FolderNotify {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for FolderNotify {
  type Error = FolderNotifyError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(FolderNotifyError::SchemeMismatch);
    }

    Ok(FolderNotify {
      directory: PathBuf::from(url.path()),
      record_counter: Arc::new(Mutex::new(0)),
    })
  }
}

impl FolderNotify {
  fn record_id(&self) -> u16 {
    let mut counter = self.record_counter.lock().unwrap();
    let id = counter.wrapping_add(1);
    *counter = id;
    id
  }

  fn record_path(&self) -> Result<PathBuf, FolderNotifyError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    if !directory.exists() {
      std::fs::create_dir_all(&directory)?;
    }

    Ok(directory.join(format!(
      "{}-{:04X}.json",
      now.format("%H-%M-%S"),
      self.record_id()
    )))
  }
}

impl Notify for FolderNotify {
  type Error = FolderNotifyError;

  fn notify(&self, record: &NotificationRecord) -> Result<(), Self::Error> {
    let path = self.record_path()?;
    let body = serde_json::to_string_pretty(&record.to_json())?;
    std::fs::write(path, body)?;
    Ok(())
  }
}
