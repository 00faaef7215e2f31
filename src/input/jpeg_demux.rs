// 该文件是 Shouye （守夜） 项目的一部分。
// src/input/jpeg_demux.rs - MJPEG 字节流分帧
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

use std::io::Read;
use std::thread;
use std::time::Duration;

use image::RgbImage;
use thiserror::Error;
use tracing::warn;

/// JPEG 帧起始标记（SOI）
const SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG 帧结束标记（EOI）
const EOI: [u8; 2] = [0xFF, 0xD9];

const READ_CHUNK_SIZE: usize = 8192;
const FRAME_RETRY_LIMIT: u32 = 3;
const FRAME_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum JpegDemuxError {
  #[error("读取流失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JPEG 解码失败: {0}")]
  DecodeError(#[from] image::ImageError),
}

/// MJPEG 连续字节流分帧器
///
/// 在任意分块到达的字节流中扫描 SOI/EOI 标记对，把两个标记（含）之间的
/// 字节切出为一帧 JPEG 并解码。累积缓冲区跨读调用保留，标记对跨块边界
/// 或同块内出现多帧都能正确处理。
///
/// `next_frame` 阻塞直到取得一帧完整图像；流结束且再无标记时返回
/// `Ok(None)`。瞬时的读取/解码失败先重试（最多 3 次，间隔 100 ms），
/// 仍失败则作为单帧失败上报，由调用方决定是否继续整条流。
pub struct JpegDemuxer<R> {
  reader: R,
  acc: Vec<u8>,
  chunk: Box<[u8]>,
  in_frame: bool,
  scanned: usize,
}

impl<R: Read> JpegDemuxer<R> {
  pub fn new(reader: R) -> Self {
    Self {
      reader,
      acc: Vec::with_capacity(READ_CHUNK_SIZE * 2),
      chunk: vec![0u8; READ_CHUNK_SIZE].into_boxed_slice(),
      in_frame: false,
      scanned: 0,
    }
  }

  /// 读取并解码下一帧。
  pub fn next_frame(&mut self) -> Result<Option<RgbImage>, JpegDemuxError> {
    let mut attempts = 0u32;
    loop {
      let result: Result<(), JpegDemuxError> = match self.next_jpeg() {
        Ok(Some(jpeg)) => match image::load_from_memory(&jpeg) {
          Ok(image) => return Ok(Some(image.to_rgb8())),
          Err(e) => Err(JpegDemuxError::from(e)),
        },
        Ok(None) => return Ok(None),
        Err(e) => Err(e),
      };

      if let Err(e) = result {
        attempts += 1;
        if attempts >= FRAME_RETRY_LIMIT {
          return Err(e);
        }
        warn!("取帧失败（第 {} 次重试）: {}", attempts, e);
        thread::sleep(FRAME_RETRY_DELAY);
      }
    }
  }

  /// 取出下一帧未解码的 JPEG 字节（SOI 到 EOI，含两端标记）。
  fn next_jpeg(&mut self) -> Result<Option<Vec<u8>>, JpegDemuxError> {
    loop {
      if let Some(frame) = self.scan() {
        return Ok(Some(frame));
      }

      let n = self.reader.read(&mut self.chunk)?;
      if n == 0 {
        // 流结束且没有完整的标记对
        return Ok(None);
      }
      self.acc.extend_from_slice(&self.chunk[..n]);
    }
  }

  /// 在累积缓冲区中推进扫描；`scanned` 记录已检查的前缀，
  /// 标记可能横跨两次读取，所以回退一个字节重新比对。
  fn scan(&mut self) -> Option<Vec<u8>> {
    if !self.in_frame {
      let from = self.scanned.saturating_sub(1);
      match find_marker(&self.acc[from..], SOI) {
        Some(i) => {
          // 丢弃 SOI 之前的边界噪声
          self.acc.drain(..from + i);
          self.in_frame = true;
          self.scanned = SOI.len();
        }
        None => {
          // 无起始标记，只保留末尾一个字节以防标记被截断
          if self.acc.len() > 1 {
            self.acc.drain(..self.acc.len() - 1);
          }
          self.scanned = self.acc.len();
          return None;
        }
      }
    }

    let from = self.scanned.saturating_sub(1).max(SOI.len());
    if let Some(i) = find_marker(&self.acc[from..], EOI) {
      let end = from + i + EOI.len();
      let frame: Vec<u8> = self.acc.drain(..end).collect();
      self.in_frame = false;
      self.scanned = 0;
      return Some(frame);
    }

    self.scanned = self.acc.len();
    None
  }
}

fn find_marker(buf: &[u8], marker: [u8; 2]) -> Option<usize> {
  buf.windows(2).position(|pair| pair == marker)
}
