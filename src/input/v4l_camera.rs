// 该文件是 Shouye （守夜） 项目的一部分。
// src/input/v4l_camera.rs - V4L2 本地摄像头输入
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

use std::pin::Pin;

use image::RgbImage;
use thiserror::Error;
use tracing::{error, info};
use url::Url;
use v4l::FourCC;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

use super::{StreamItem, StreamStatus};
use crate::frame::RgbNhwcFrame;
use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum V4lCameraInputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("V4L error: {0}")]
  V4lError(String),
}

const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;

/// V4L2 摄像头输入构建器
///
/// URL 形如 `v4l:///dev/video0?width=640&height=480`。
pub struct V4lCameraBuilder<const W: u32, const H: u32> {
  device_path: String,
  width: u32,
  height: u32,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for V4lCameraBuilder<W, H> {
  const SCHEME: &'static str = "v4l";
}

impl<const W: u32, const H: u32> FromUrl for V4lCameraBuilder<W, H> {
  type Error = V4lCameraInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(V4lCameraInputError::SchemeMismatch);
    }

    let device_path = if url.path().is_empty() {
      "/dev/video0".to_string()
    } else {
      url.path().to_string()
    };

    let mut width = DEFAULT_CAPTURE_WIDTH;
    let mut height = DEFAULT_CAPTURE_HEIGHT;
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "width" => {
          if let Ok(v) = value.parse() {
            width = v;
          }
        }
        "height" => {
          if let Ok(v) = value.parse() {
            height = v;
          }
        }
        _ => {}
      }
    }

    Ok(V4lCameraBuilder {
      device_path,
      width,
      height,
    })
  }
}

impl<const W: u32, const H: u32> V4lCameraBuilder<W, H> {
  pub fn build(self) -> Result<V4lCameraInput<W, H>, V4lCameraInputError> {
    let device = Box::pin(
      Device::with_path(&self.device_path)
        .map_err(|e| V4lCameraInputError::V4lError(format!("无法打开设备: {}", e)))?,
    );

    let mut format = device
      .format()
      .map_err(|e| V4lCameraInputError::V4lError(e.to_string()))?;
    format.width = self.width;
    format.height = self.height;
    format.fourcc = FourCC::new(b"YUYV");
    let format = device
      .set_format(&format)
      .map_err(|e| V4lCameraInputError::V4lError(e.to_string()))?;

    info!(
      "V4L2 摄像头已打开: {} {}x{}",
      self.device_path, format.width, format.height
    );

    let mut source = V4lCameraInput {
      device,
      stream: None,
      width: format.width,
      height: format.height,
      announced: false,
      finished: false,
    };

    // SAFETY: device 被 Pin<Box> 固定，不会移动，所以引用始终有效
    // Stream 的生命周期通过 source 的 Drop 来管理：
    // 1. device 被 Pin<Box> 固定在堆上，不会移动
    // 2. stream 存储在同一个结构体中，会在 device 之前被 drop
    // 3. Drop 顺序：stream (Option::take) -> device
    let device_ref: &Device = &source.device;
    let stream = unsafe {
      let device_static: &'static Device = std::mem::transmute(device_ref);
      Stream::with_buffers(device_static, Type::VideoCapture, 4)
        .map_err(|e| V4lCameraInputError::V4lError(format!("无法创建捕获流: {}", e)))?
    };

    source.stream = Some(stream);
    Ok(source)
  }
}

/// V4L2 本地摄像头输入
///
/// 本地检测模式的帧来源；设备句柄在 Drop 时释放（先 stream 后 device）。
pub struct V4lCameraInput<const W: u32, const H: u32> {
  device: Pin<Box<Device>>,
  stream: Option<Stream<'static>>,
  width: u32,
  height: u32,
  announced: bool,
  finished: bool,
}

impl<const W: u32, const H: u32> Drop for V4lCameraInput<W, H> {
  fn drop(&mut self) {
    // 确保 stream 在 device 之前被 drop
    self.stream.take();
  }
}

/// 将 YUYV 格式转换为 RGB
fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Vec<u8> {
  let mut rgb = Vec::with_capacity((width * height * 3) as usize);

  for chunk in yuyv.chunks(4) {
    if chunk.len() < 4 {
      break;
    }

    let y0 = chunk[0] as f32;
    let u = chunk[1] as f32 - 128.0;
    let y1 = chunk[2] as f32;
    let v = chunk[3] as f32 - 128.0;

    // 第一个像素
    let r = (y0 + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y0 - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
    let b = (y0 + 1.772 * u).clamp(0.0, 255.0) as u8;
    rgb.extend_from_slice(&[r, g, b]);

    // 第二个像素
    let r = (y1 + 1.402 * v).clamp(0.0, 255.0) as u8;
    let g = (y1 - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
    let b = (y1 + 1.772 * u).clamp(0.0, 255.0) as u8;
    rgb.extend_from_slice(&[r, g, b]);
  }

  rgb
}

impl<const W: u32, const H: u32> Iterator for V4lCameraInput<W, H> {
  type Item = StreamItem<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    if !self.announced {
      self.announced = true;
      return Some(StreamItem::Status(StreamStatus::Streaming));
    }

    let stream = self.stream.as_mut()?;
    match stream.next() {
      Ok((buffer, _meta)) => {
        let rgb_data = yuyv_to_rgb(buffer, self.width, self.height);
        match RgbImage::from_raw(self.width, self.height, rgb_data) {
          Some(image) => Some(StreamItem::Frame(RgbNhwcFrame::from_image(&image))),
          None => {
            error!("无法创建 RGB 图像");
            self.finished = true;
            Some(StreamItem::Status(StreamStatus::Error(
              "无法创建 RGB 图像".to_string(),
            )))
          }
        }
      }
      Err(e) => {
        // 硬件错误视为终态，句柄随 Drop 释放
        error!("无法捕获帧: {}", e);
        self.finished = true;
        Some(StreamItem::Status(StreamStatus::Error(format!(
          "无法捕获帧: {}",
          e
        ))))
      }
    }
  }
}
