// 该文件是 Shouye （守夜） 项目的一部分。
// src/frame.rs - NHWC 帧与帧窗口定义
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

use chrono::Utc;
use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::input::AsNhwcFrame;

const RGB_CHANNELS: usize = 3;

/// 已解码的 RGB 帧（NHWC 布局）
///
/// 携带捕获时间戳（Unix 毫秒）。帧在帧槽与推理窗口之间按值转移所有权，
/// 被覆盖或消费后即释放。
#[derive(Debug, Clone)]
pub struct RgbNhwcFrame<const W: u32, const H: u32> {
  data: Box<[u8]>,
  timestamp_ms: i64,
}

impl<const W: u32, const H: u32> From<Vec<u8>> for RgbNhwcFrame<W, H> {
  fn from(data: Vec<u8>) -> Self {
    if data.len() != (RGB_CHANNELS * W as usize * H as usize) {
      panic!(
        "数据长度不匹配: 期望长度 {}, 实际长度 {}",
        RGB_CHANNELS * W as usize * H as usize,
        data.len()
      );
    }

    Self {
      data: data.into_boxed_slice(),
      timestamp_ms: Utc::now().timestamp_millis(),
    }
  }
}

impl<const W: u32, const H: u32> Default for RgbNhwcFrame<W, H> {
  fn default() -> Self {
    let size = RGB_CHANNELS * (W as usize) * (H as usize);
    let data = vec![0u8; size].into_boxed_slice();
    Self {
      data,
      timestamp_ms: 0,
    }
  }
}

impl<const W: u32, const H: u32> RgbNhwcFrame<W, H> {
  /// 从任意尺寸的 RGB 图像构造帧，尺寸不符时缩放到 W x H。
  pub fn from_image(image: &RgbImage) -> Self {
    let data = if image.dimensions() == (W, H) {
      image.as_raw().clone()
    } else {
      imageops::resize(image, W, H, FilterType::Triangle).into_raw()
    };

    Self {
      data: data.into_boxed_slice(),
      timestamp_ms: Utc::now().timestamp_millis(),
    }
  }

  pub fn with_timestamp_ms(mut self, timestamp_ms: i64) -> Self {
    self.timestamp_ms = timestamp_ms;
    self
  }

  pub fn timestamp_ms(&self) -> i64 {
    self.timestamp_ms
  }

  pub fn height(&self) -> usize {
    H as usize
  }

  pub fn width(&self) -> usize {
    W as usize
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }
}

impl<const W: u32, const H: u32> AsMut<[u8]> for RgbNhwcFrame<W, H> {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl<const W: u32, const H: u32> AsNhwcFrame<W, H> for RgbNhwcFrame<W, H> {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

/// 推理帧窗口
///
/// 由推理调度器跨多个节拍累积的有序帧序列，长度不超过容量；
/// 每次成功推理后清空。
#[derive(Debug, Default)]
pub struct FrameWindow<const W: u32, const H: u32> {
  frames: Vec<RgbNhwcFrame<W, H>>,
  capacity: usize,
}

impl<const W: u32, const H: u32> FrameWindow<W, H> {
  pub fn new(capacity: usize) -> Self {
    Self {
      frames: Vec::with_capacity(capacity),
      capacity,
    }
  }

  /// 追加一帧；窗口已满时淘汰最旧的一帧。
  pub fn push(&mut self, frame: RgbNhwcFrame<W, H>) {
    if self.frames.len() >= self.capacity {
      self.frames.remove(0);
    }
    self.frames.push(frame);
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  pub fn is_full(&self) -> bool {
    self.frames.len() >= self.capacity
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn clear(&mut self) {
    self.frames.clear();
  }

  pub fn frames(&self) -> &[RgbNhwcFrame<W, H>] {
    &self.frames
  }

  /// 窗口覆盖的时间范围（首帧与末帧的时间戳）。
  pub fn span(&self) -> Option<(i64, i64)> {
    let first = self.frames.first()?.timestamp_ms();
    let last = self.frames.last()?.timestamp_ms();
    Some((first, last))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame_with_ts(ts: i64) -> RgbNhwcFrame<2, 2> {
    RgbNhwcFrame::from(vec![0u8; 2 * 2 * 3]).with_timestamp_ms(ts)
  }

  #[test]
  fn window_caps_length_and_keeps_order() {
    let mut window = FrameWindow::<2, 2>::new(3);
    for ts in 1..=5 {
      window.push(frame_with_ts(ts));
    }

    assert_eq!(window.len(), 3);
    assert!(window.is_full());
    assert_eq!(window.span(), Some((3, 5)));
  }

  #[test]
  fn window_clear_resets_span() {
    let mut window = FrameWindow::<2, 2>::new(2);
    window.push(frame_with_ts(7));
    window.clear();

    assert!(window.is_empty());
    assert_eq!(window.span(), None);
  }

  #[test]
  fn from_image_resizes_to_const_shape() {
    let image = RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30]));
    let frame = RgbNhwcFrame::<4, 4>::from_image(&image);

    assert_eq!(frame.as_nhwc().len(), 4 * 4 * 3);
    assert!(frame.timestamp_ms() > 0);
  }

  #[test]
  fn from_image_copies_matching_shape_without_resample() {
    let image = RgbImage::from_pixel(4, 4, image::Rgb([1, 2, 3]));
    let frame = RgbNhwcFrame::<4, 4>::from_image(&image);

    assert_eq!(&frame.as_nhwc()[..3], &[1, 2, 3]);
  }
}
