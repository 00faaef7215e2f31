// 该文件是 Shouye （守夜） 项目的一部分。
// src/input.rs - 视频流输入
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

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

use crate::FromUrl;
use crate::frame::RgbNhwcFrame;

pub trait AsNhwcFrame<const W: u32, const H: u32> {
  fn as_nhwc(&self) -> &[u8];
}

mod jpeg_demux;
pub use self::jpeg_demux::{JpegDemuxError, JpegDemuxer};

#[cfg(feature = "mjpeg_input")]
mod mjpeg_stream;
#[cfg(feature = "mjpeg_input")]
pub use self::mjpeg_stream::{
  Connector, HttpConnector, MjpegStreamBuilder, MjpegStreamError, MjpegStreamInput,
};

#[cfg(feature = "replay_input")]
mod image_dir;
#[cfg(feature = "replay_input")]
pub use self::image_dir::{ImageDirInput, ImageDirInputError};

#[cfg(feature = "v4l_input")]
mod v4l_camera;
#[cfg(feature = "v4l_input")]
pub use self::v4l_camera::{V4lCameraBuilder, V4lCameraInput, V4lCameraInputError};

/// 视频流连接状态
///
/// 每次状态变化都会作为事件发布给下游显示；`Display` 输出即人类可读的
/// 状态文本，不暴露结构化错误码。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
  /// 第 attempt 次连接中（共 max 次预算）
  Connecting { attempt: u32, max: u32 },
  /// 已连上，帧正常流动
  Streaming,
  /// 本次连接/读取失败
  Error(String),
  /// 重试预算耗尽，终态；需要外部显式重启
  Disconnected,
}

impl fmt::Display for StreamStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StreamStatus::Connecting { attempt, max } => write!(f, "Connecting ({}/{})", attempt, max),
      StreamStatus::Streaming => write!(f, "Streaming"),
      StreamStatus::Error(message) => write!(f, "Error: {}", message),
      StreamStatus::Disconnected => write!(f, "Disconnected"),
    }
  }
}

/// 输入流中的一项：解码好的帧，或一次状态变化。
///
/// 状态与帧走同一条流，取代向输入源塞回调闭包的做法。
pub enum StreamItem<const W: u32, const H: u32> {
  Frame(RgbNhwcFrame<W, H>),
  Status(StreamStatus),
}

#[derive(Error, Debug)]
pub enum InputError {
  #[cfg(feature = "mjpeg_input")]
  #[error("MJPEG stream input error: {0}")]
  MjpegStreamError(#[from] MjpegStreamError),
  #[cfg(feature = "replay_input")]
  #[error("Image directory input error: {0}")]
  ImageDirInputError(#[from] ImageDirInputError),
  #[cfg(feature = "v4l_input")]
  #[error("V4L camera input error: {0}")]
  V4lCameraInputError(#[from] V4lCameraInputError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

pub enum InputWrapper<const W: u32, const H: u32> {
  #[cfg(feature = "mjpeg_input")]
  MjpegStream(MjpegStreamInput<W, H>),
  #[cfg(feature = "replay_input")]
  ImageDir(ImageDirInput<W, H>),
  #[cfg(feature = "v4l_input")]
  V4lCamera(V4lCameraInput<W, H>),
}

impl<const W: u32, const H: u32> FromUrl for InputWrapper<W, H> {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "mjpeg_input")]
    {
      if url.scheme() == "http" || url.scheme() == "https" {
        let input = MjpegStreamBuilder::from_url(url)?.build();
        return Ok(InputWrapper::MjpegStream(input));
      }
    }
    #[cfg(feature = "replay_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == ImageDirInput::<W, H>::SCHEME {
        let input = ImageDirInput::from_url(url)?;
        return Ok(InputWrapper::ImageDir(input));
      }
    }
    #[cfg(feature = "v4l_input")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == V4lCameraBuilder::<W, H>::SCHEME {
        let input = V4lCameraBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::V4lCamera(input));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl<const W: u32, const H: u32> InputWrapper<W, H> {
  /// 绑定会话停止标志；取流循环在每帧之间检查它。
  pub fn bind_stop(&mut self, stop: Arc<AtomicBool>) {
    match self {
      #[cfg(feature = "mjpeg_input")]
      InputWrapper::MjpegStream(input) => input.bind_stop(stop),
      #[cfg(feature = "replay_input")]
      InputWrapper::ImageDir(_) => {
        let _ = stop;
      }
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4lCamera(_) => {
        let _ = stop;
      }
    }
  }
}

impl<const W: u32, const H: u32> Iterator for InputWrapper<W, H> {
  type Item = StreamItem<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    match self {
      #[cfg(feature = "mjpeg_input")]
      InputWrapper::MjpegStream(input) => input.next(),
      #[cfg(feature = "replay_input")]
      InputWrapper::ImageDir(input) => input.next(),
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4lCamera(input) => input.next(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_strings_are_human_readable() {
    assert_eq!(
      StreamStatus::Connecting { attempt: 1, max: 3 }.to_string(),
      "Connecting (1/3)"
    );
    assert_eq!(StreamStatus::Streaming.to_string(), "Streaming");
    assert_eq!(
      StreamStatus::Error("connection refused".into()).to_string(),
      "Error: connection refused"
    );
    assert_eq!(StreamStatus::Disconnected.to_string(), "Disconnected");
  }
}
