// 该文件是 Shouye （守夜） 项目的一部分。
// src/input/mjpeg_stream.rs - MJPEG 网络流输入
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

//! # MJPEG 网络流输入模块
//!
//! 通过普通 HTTP GET 连接 `multipart/x-mixed-replace` 风格的 MJPEG
//! 摄像头流，维护连接生命周期：连接、失败重试、预算耗尽后停机。
//!
//! ## 连接生命周期
//!
//! - 连接超时 10 秒，读取超时 15 秒；
//! - 连接或取流失败时重试，预算默认 3 次；
//! - 每成功读出一帧，重试计数清零（持续出帧即视为健康）；
//! - 预算耗尽进入终态 `Disconnected`，不会自动重启，需要外部重新
//!   `start()`。
//!
//! 每个阶段都会在帧流中插入一条 [`StreamStatus`] 事件：
//! `Connecting (n/max)`、`Streaming`、`Error: …`、`Disconnected`。
//!
//! 底层套接字由迭代器状态持有，任何退出路径（正常停止、预算耗尽、
//! 出错换连接）都随状态替换被关闭。
//!
//! ## 基本用法
//!
//! ```no_run
//! use shouye::{FromUrl, input::{MjpegStreamBuilder, StreamItem}};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let url = Url::parse("http://192.168.1.20:8080/video")?;
//! let input = MjpegStreamBuilder::<224, 224>::from_url(&url)?.build();
//!
//! for item in input {
//!     match item {
//!         StreamItem::Frame(frame) => println!("帧时间戳: {}", frame.timestamp_ms()),
//!         StreamItem::Status(status) => println!("状态: {}", status),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## URL 查询参数
//!
//! - `retries`：连接重试预算（默认 3）；
//! - `connect-timeout-ms` / `read-timeout-ms`：超时覆盖。
//!
//! 这些参数在交给摄像头之前会从 URL 中剥除。

use std::collections::VecDeque;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use super::jpeg_demux::{JpegDemuxError, JpegDemuxer};
use super::{StreamItem, StreamStatus};
use crate::frame::RgbNhwcFrame;
use crate::{FromUrl, FromUrlWithScheme};

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum MjpegStreamError {
  /// URI scheme 不匹配（期望 "http" 或 "https"）
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  /// 建立连接失败
  #[error("连接失败: {0}")]
  ConnectError(String),
  /// 分帧/解码失败
  #[error("取流失败: {0}")]
  DemuxError(#[from] JpegDemuxError),
}

/// 建立到摄像头的读取连接
///
/// 网络层的接缝：默认实现走 HTTP GET，测试可以注入任意拨号器。
pub trait Connector: Send {
  fn connect(&self, url: &Url) -> Result<Box<dyn Read + Send>, MjpegStreamError>;
}

/// 基于 ureq 的 HTTP 拨号器
pub struct HttpConnector {
  agent: ureq::Agent,
}

impl HttpConnector {
  pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
    let agent = ureq::AgentBuilder::new()
      .timeout_connect(connect_timeout)
      .timeout_read(read_timeout)
      .build();
    Self { agent }
  }
}

impl Connector for HttpConnector {
  fn connect(&self, url: &Url) -> Result<Box<dyn Read + Send>, MjpegStreamError> {
    let response = self
      .agent
      .get(url.as_str())
      .call()
      .map_err(|e| MjpegStreamError::ConnectError(e.to_string()))?;
    Ok(Box::new(response.into_reader()))
  }
}

/// MJPEG 流输入构建器
pub struct MjpegStreamBuilder<const W: u32, const H: u32> {
  url: Url,
  max_retries: u32,
  connect_timeout: Duration,
  read_timeout: Duration,
  connector: Option<Box<dyn Connector>>,
  stop: Option<Arc<AtomicBool>>,
}

impl<const W: u32, const H: u32> FromUrlWithScheme for MjpegStreamBuilder<W, H> {
  const SCHEME: &'static str = "http";
}

impl<const W: u32, const H: u32> FromUrl for MjpegStreamBuilder<W, H> {
  type Error = MjpegStreamError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != "http" && url.scheme() != "https" {
      return Err(MjpegStreamError::SchemeMismatch);
    }

    let mut max_retries = DEFAULT_MAX_RETRIES;
    let mut connect_timeout = DEFAULT_CONNECT_TIMEOUT;
    let mut read_timeout = DEFAULT_READ_TIMEOUT;
    let mut camera_query: Vec<(String, String)> = Vec::new();

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "retries" => {
          if let Ok(n) = value.parse::<u32>() {
            max_retries = n;
          }
        }
        "connect-timeout-ms" => {
          if let Ok(ms) = value.parse::<u64>() {
            connect_timeout = Duration::from_millis(ms);
          }
        }
        "read-timeout-ms" => {
          if let Ok(ms) = value.parse::<u64>() {
            read_timeout = Duration::from_millis(ms);
          }
        }
        _ => camera_query.push((key.into_owned(), value.into_owned())),
      }
    }

    // 剥除本模块的控制参数，余下的照原样交给摄像头
    let mut camera_url = url.clone();
    camera_url.set_query(None);
    if !camera_query.is_empty() {
      let mut pairs = camera_url.query_pairs_mut();
      for (key, value) in &camera_query {
        pairs.append_pair(key, value);
      }
    }

    Ok(MjpegStreamBuilder {
      url: camera_url,
      max_retries,
      connect_timeout,
      read_timeout,
      connector: None,
      stop: None,
    })
  }
}

impl<const W: u32, const H: u32> MjpegStreamBuilder<W, H> {
  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn connector(mut self, connector: Box<dyn Connector>) -> Self {
    self.connector = Some(connector);
    self
  }

  pub fn stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
    self.stop = Some(stop);
    self
  }

  pub fn build(self) -> MjpegStreamInput<W, H> {
    let connector = self
      .connector
      .unwrap_or_else(|| Box::new(HttpConnector::new(self.connect_timeout, self.read_timeout)));
    let stop = self.stop.unwrap_or_default();

    info!("MJPEG 输入源: {}", self.url);

    MjpegStreamInput {
      url: self.url,
      connector,
      max_retries: self.max_retries,
      stop,
      attempt: 0,
      state: StreamState::Idle,
      queue: VecDeque::new(),
    }
  }
}

enum StreamState {
  Idle,
  Streaming(JpegDemuxer<Box<dyn Read + Send>>),
  Finished,
}

/// MJPEG 网络流输入
///
/// 迭代产出 [`StreamItem`]：解码后的帧与状态事件交织在同一条流上。
/// 重试预算耗尽后发出 `Disconnected` 并结束迭代。
pub struct MjpegStreamInput<const W: u32, const H: u32> {
  url: Url,
  connector: Box<dyn Connector>,
  max_retries: u32,
  stop: Arc<AtomicBool>,
  attempt: u32,
  state: StreamState,
  queue: VecDeque<StreamItem<W, H>>,
}

impl<const W: u32, const H: u32> MjpegStreamInput<W, H> {
  /// 绑定会话停止标志；置位后迭代在下一个边界结束。
  pub fn bind_stop(&mut self, stop: Arc<AtomicBool>) {
    self.stop = stop;
  }

  fn push_status(&mut self, status: StreamStatus) {
    self.queue.push_back(StreamItem::Status(status));
  }
}

impl<const W: u32, const H: u32> Iterator for MjpegStreamInput<W, H> {
  type Item = StreamItem<W, H>;

  fn next(&mut self) -> Option<Self::Item> {
    loop {
      if self.stop.load(Ordering::Relaxed) {
        // 取消只在帧边界生效；连接随状态一起丢弃
        self.state = StreamState::Finished;
        return None;
      }

      if let Some(item) = self.queue.pop_front() {
        return Some(item);
      }

      match std::mem::replace(&mut self.state, StreamState::Finished) {
        StreamState::Finished => return None,
        StreamState::Idle => {
          if self.attempt >= self.max_retries {
            info!("重试预算耗尽（{} 次），停止取流", self.max_retries);
            self.push_status(StreamStatus::Disconnected);
            continue;
          }

          self.attempt += 1;
          self.push_status(StreamStatus::Connecting {
            attempt: self.attempt,
            max: self.max_retries,
          });

          match self.connector.connect(&self.url) {
            Ok(reader) => {
              self.push_status(StreamStatus::Streaming);
              self.state = StreamState::Streaming(JpegDemuxer::new(reader));
            }
            Err(e) => {
              warn!("连接失败（第 {} 次）: {}", self.attempt, e);
              self.push_status(StreamStatus::Error(e.to_string()));
              self.state = StreamState::Idle;
            }
          }
        }
        StreamState::Streaming(mut demuxer) => match demuxer.next_frame() {
          Ok(Some(image)) => {
            // 持续出帧即健康，重试计数清零
            self.attempt = 0;
            self.state = StreamState::Streaming(demuxer);
            return Some(StreamItem::Frame(RgbNhwcFrame::from_image(&image)));
          }
          Ok(None) => {
            // 旧连接随 demuxer 一起释放
            warn!("视频流已结束，准备重连");
            self.push_status(StreamStatus::Error("视频流已结束".to_string()));
            self.state = StreamState::Idle;
          }
          Err(e) => {
            warn!("取流失败: {}", e);
            self.push_status(StreamStatus::Error(e.to_string()));
            self.state = StreamState::Idle;
          }
        },
      }
    }
  }
}
