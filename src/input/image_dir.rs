// 该文件是 Shouye （守夜） 项目的一部分。
// src/input/image_dir.rs - 录像帧目录回放输入
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

use std::collections::VecDeque;
use std::path::PathBuf;

use image::ImageReader;
use thiserror::Error;
use tracing::warn;
use url::Url;

use super::{StreamItem, StreamStatus};
use crate::frame::RgbNhwcFrame;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum ImageDirInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
}

/// 录像帧目录回放输入
///
/// 把一个目录里按文件名排序的 JPEG/PNG 帧当作一条视频流回放，
/// 用于离线评估模型。坏帧记日志后跳过，不中断回放。
pub struct ImageDirInput<const W: u32, const H: u32> {
  paths: VecDeque<PathBuf>,
  announced: bool,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for ImageDirInput<W, H> {
  const SCHEME: &'static str = "frames";
}

impl<const W: u32, const H: u32> FromUrl for ImageDirInput<W, H> {
  type Error = ImageDirInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ImageDirInputError::SchemeMismatch);
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(url.path())?
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| {
        matches!(
          path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase()),
          Some(ref ext) if ext == "jpg" || ext == "jpeg" || ext == "png"
        )
      })
      .collect();
    paths.sort();

    Ok(ImageDirInput {
      paths: paths.into(),
      announced: false,
    })
  }
}

impl<const W: u32, const H: u32> Iterator for ImageDirInput<W, H> {
  type Item = StreamItem<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    if !self.announced {
      self.announced = true;
      return Some(StreamItem::Status(StreamStatus::Streaming));
    }

    while let Some(path) = self.paths.pop_front() {
      let decoded = ImageReader::open(&path).and_then(|reader| {
        reader
          .decode()
          .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
      });
      match decoded {
        Ok(image) => {
          return Some(StreamItem::Frame(RgbNhwcFrame::from_image(
            &image.into_rgb8(),
          )));
        }
        Err(e) => {
          warn!("跳过无法读取的帧 {}: {}", path.display(), e);
        }
      }
    }

    None
  }
}
