// 该文件是 Shouye （守夜） 项目的一部分。
// src/session.rs - 检测会话管理
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

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::frame::RgbNhwcFrame;
use crate::input::{StreamItem, StreamStatus};
use crate::model::{ClassifierBackend, PadPolicy, Prediction, WindowClassifier};
use crate::output::{AlertDispatcher, NotificationKind, Notify, SendSms};
use crate::policy::{AlertEvent, AlertPolicy};
use crate::slot::FrameSlot;
use crate::task::WatchLoop;

/// 默认远程流检测参数
pub const REMOTE_THRESHOLD: f32 = 0.80;
/// 默认本地摄像头检测参数
pub const LOCAL_THRESHOLD: f32 = 0.75;
pub const CONSECUTIVE_LIMIT: u32 = 3;
pub const REMOTE_INTERVAL: Duration = Duration::from_millis(5000);
pub const LOCAL_INTERVAL: Duration = Duration::from_millis(100);

static SESSION_COUNTER: AtomicU16 = AtomicU16::new(0);

/// 核心向外发布的事件
///
/// 状态、预测、警报都走这一条通道，核心不感知任何展示层。
#[derive(Debug, Clone)]
pub enum DetectorEvent {
  Status(StreamStatus),
  Prediction(Prediction),
  Alert(AlertEvent),
  Stopped,
}

/// 检测会话配置
#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub user_id: String,
  pub threshold: f32,
  pub consecutive_limit: u32,
  pub interval: Duration,
  pub pad_policy: PadPolicy,
}

impl SessionConfig {
  /// 远程 MJPEG 流检测预设
  pub fn remote(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      threshold: REMOTE_THRESHOLD,
      consecutive_limit: CONSECUTIVE_LIMIT,
      interval: REMOTE_INTERVAL,
      pad_policy: PadPolicy::default(),
    }
  }

  /// 本地摄像头检测预设
  pub fn local(user_id: impl Into<String>) -> Self {
    Self {
      user_id: user_id.into(),
      threshold: LOCAL_THRESHOLD,
      consecutive_limit: CONSECUTIVE_LIMIT,
      interval: LOCAL_INTERVAL,
      pad_policy: PadPolicy::default(),
    }
  }

  pub fn with_threshold(mut self, threshold: f32) -> Self {
    self.threshold = threshold;
    self
  }

  pub fn with_consecutive_limit(mut self, limit: u32) -> Self {
    self.consecutive_limit = limit;
    self
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_pad_policy(mut self, pad_policy: PadPolicy) -> Self {
    self.pad_policy = pad_policy;
    self
  }
}

/// 会话状态快照
#[derive(Debug, Clone)]
pub struct DetectionSession {
  pub session_id: String,
  pub user_id: String,
  pub start_time_ms: i64,
  pub streaming: bool,
  pub consecutive: u32,
}

/// 会话运行状态
///
/// 单写者纪律：`consecutive` 只由推理循环写，`streaming` 只由取流
/// 循环写，其余字段自创建起不变；其他任务只读快照。
pub struct SessionState {
  session_id: String,
  user_id: String,
  start_time_ms: i64,
  streaming: AtomicBool,
  consecutive: AtomicU32,
}

impl SessionState {
  pub fn new(user_id: impl Into<String>) -> Self {
    let start_time_ms = Utc::now().timestamp_millis();
    let serial = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    Self {
      session_id: format!("{:X}-{:04X}", start_time_ms, serial),
      user_id: user_id.into(),
      start_time_ms,
      streaming: AtomicBool::new(false),
      consecutive: AtomicU32::new(0),
    }
  }

  pub fn session_id(&self) -> &str {
    &self.session_id
  }

  pub fn set_streaming(&self, streaming: bool) {
    self.streaming.store(streaming, Ordering::Relaxed);
  }

  pub fn set_consecutive(&self, consecutive: u32) {
    self.consecutive.store(consecutive, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> DetectionSession {
    DetectionSession {
      session_id: self.session_id.clone(),
      user_id: self.user_id.clone(),
      start_time_ms: self.start_time_ms,
      streaming: self.streaming.load(Ordering::Relaxed),
      consecutive: self.consecutive.load(Ordering::Relaxed),
    }
  }
}

/// 运行中的检测会话
///
/// `start()` 在同一监督范围下派生两个线程：取流循环
/// （连接器 + 分帧 → 帧槽）与推理循环（调度器）。一个循环内的故障
/// 由各自就地处理，绝不波及另一个循环。
///
/// `stop()` 幂等，按固定顺序拆除：两个循环先收到取消信号并汇合，
/// 分类器随推理线程退出释放，采集设备/套接字随取流线程退出释放，
/// 帧槽中滞留的最后一帧随后清空。取消只在循环迭代边界生效，
/// 单次分类调用不可抢占。
pub struct WatchSession<const W: u32, const H: u32> {
  stop_flag: Arc<AtomicBool>,
  stop_tx: Option<Sender<()>>,
  producer: Option<JoinHandle<()>>,
  consumer: Option<JoinHandle<()>>,
  slot: Arc<FrameSlot<RgbNhwcFrame<W, H>>>,
  state: Arc<SessionState>,
  events: Sender<DetectorEvent>,
  on_stop: Option<Box<dyn FnOnce() + Send>>,
}

impl<const W: u32, const H: u32> WatchSession<W, H> {
  /// 启动检测会话。
  ///
  /// `make_input` 在拿到会话停止标志后构造输入迭代器，
  /// 让取流循环能在帧边界响应取消。
  pub fn start<I, F, B, N, S>(
    config: SessionConfig,
    make_input: F,
    classifier: WindowClassifier<W, H, B>,
    dispatcher: AlertDispatcher<N, S>,
    events: Sender<DetectorEvent>,
  ) -> Self
  where
    F: FnOnce(Arc<AtomicBool>) -> I,
    I: Iterator<Item = StreamItem<W, H>> + Send + 'static,
    B: ClassifierBackend + Send + 'static,
    N: Notify + Send + Sync + 'static,
    S: SendSms + Send + Sync + 'static,
  {
    let state = Arc::new(SessionState::new(config.user_id.clone()));
    let session_id = state.session_id().to_string();
    info!("检测会话 {} 启动（用户 {}）", session_id, config.user_id);

    dispatcher.announce(NotificationKind::SessionStart, &session_id, "检测会话已开始");

    let stop_flag = Arc::new(AtomicBool::new(false));
    let slot = Arc::new(FrameSlot::new());
    let (stop_tx, stop_rx) = mpsc::channel();

    let input = make_input(stop_flag.clone());
    let producer = {
      let slot = slot.clone();
      let state = state.clone();
      let events = events.clone();
      let stop_flag = stop_flag.clone();
      std::thread::spawn(move || {
        for item in input {
          if stop_flag.load(Ordering::Relaxed) {
            break;
          }
          match item {
            StreamItem::Frame(frame) => slot.publish(frame),
            StreamItem::Status(status) => {
              state.set_streaming(matches!(status, StreamStatus::Streaming));
              let _ = events.send(DetectorEvent::Status(status));
            }
          }
        }
        state.set_streaming(false);
        info!("取流循环退出");
      })
    };

    let consumer = {
      let watch_loop = WatchLoop {
        slot: slot.clone(),
        classifier: classifier.with_pad_policy(config.pad_policy),
        policy: AlertPolicy::new(config.threshold, config.consecutive_limit, &*session_id),
        dispatcher: dispatcher.clone(),
        events: events.clone(),
        state: state.clone(),
        interval: config.interval,
        stop: stop_rx,
      };
      std::thread::spawn(move || watch_loop.run())
    };

    let on_stop = {
      let session_id = session_id.clone();
      Box::new(move || {
        dispatcher.announce(NotificationKind::SessionStop, &session_id, "检测会话已结束");
      }) as Box<dyn FnOnce() + Send>
    };

    WatchSession {
      stop_flag,
      stop_tx: Some(stop_tx),
      producer: Some(producer),
      consumer: Some(consumer),
      slot,
      state,
      events,
      on_stop: Some(on_stop),
    }
  }

  pub fn snapshot(&self) -> DetectionSession {
    self.state.snapshot()
  }

  /// 停止会话；重复调用是无害的空操作。
  pub fn stop(&mut self) {
    if self.stop_flag.swap(true, Ordering::SeqCst) {
      return;
    }
    info!("停止检测会话 {}", self.state.session_id());

    if let Some(stop_tx) = self.stop_tx.take() {
      let _ = stop_tx.send(());
    }
    if let Some(consumer) = self.consumer.take() {
      let _ = consumer.join();
    }
    if let Some(producer) = self.producer.take() {
      let _ = producer.join();
    }
    self.slot.clear();
    if let Some(on_stop) = self.on_stop.take() {
      on_stop();
    }
    let _ = self.events.send(DetectorEvent::Stopped);
  }
}

impl<const W: u32, const H: u32> Drop for WatchSession<W, H> {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::output::{NotificationRecord, SmsRoute};
  use std::sync::Mutex;
  use std::sync::mpsc::Receiver;
  use std::time::Instant;

  #[derive(Debug, thiserror::Error)]
  #[error("sink failure")]
  struct SinkFailure;

  #[derive(Default)]
  struct RecordingNotify {
    records: Mutex<Vec<NotificationRecord>>,
  }

  impl Notify for &'static RecordingNotify {
    type Error = SinkFailure;

    fn notify(&self, record: &NotificationRecord) -> Result<(), Self::Error> {
      self.records.lock().unwrap().push(record.clone());
      Ok(())
    }
  }

  #[derive(Default)]
  struct RecordingSms {
    sent: Mutex<usize>,
  }

  impl SendSms for &'static RecordingSms {
    type Error = SinkFailure;

    fn send_sms(&self, _to: &str, _from: &str, _body: &str) -> Result<bool, Self::Error> {
      *self.sent.lock().unwrap() += 1;
      Ok(true)
    }
  }

  #[derive(Debug, thiserror::Error)]
  #[error("backend failure")]
  struct NoFail;

  struct ConstBackend(f32);

  impl ClassifierBackend for ConstBackend {
    type Error = NoFail;

    fn run(&mut self, _input: &[f32], _shape: &[usize; 5]) -> Result<[f32; 2], Self::Error> {
      Ok([self.0, 1.0 - self.0])
    }
  }

  fn frame() -> RgbNhwcFrame<4, 4> {
    RgbNhwcFrame::from(vec![128u8; 4 * 4 * 3])
  }

  fn drain_until_stopped(events: &Receiver<DetectorEvent>) -> Vec<DetectorEvent> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      match events.recv_timeout(Duration::from_millis(50)) {
        Ok(DetectorEvent::Stopped) => {
          seen.push(DetectorEvent::Stopped);
          break;
        }
        Ok(event) => seen.push(event),
        Err(_) => {}
      }
    }
    seen
  }

  #[test]
  fn stop_is_idempotent_and_emits_single_stopped_event() {
    let notify: &'static RecordingNotify = Box::leak(Box::new(RecordingNotify::default()));
    let dispatcher: AlertDispatcher<_, &'static RecordingSms> =
      AlertDispatcher::new(notify, "u-1");
    let classifier = WindowClassifier::<4, 4, _>::new(ConstBackend(0.0)).with_window_len(2);
    let (events_tx, events_rx) = mpsc::channel();

    let config = SessionConfig::remote("u-1").with_interval(Duration::from_millis(5));
    let mut session = WatchSession::start(
      config,
      |_stop| std::iter::empty(),
      classifier,
      dispatcher,
      events_tx,
    );

    std::thread::sleep(Duration::from_millis(30));
    session.stop();
    session.stop();

    let stopped = drain_until_stopped(&events_rx)
      .into_iter()
      .filter(|event| matches!(event, DetectorEvent::Stopped))
      .count();
    assert_eq!(stopped, 1);
    assert!(!session.snapshot().streaming);

    // 会话启停各写一条记录
    let kinds: Vec<_> = notify
      .records
      .lock()
      .unwrap()
      .iter()
      .map(|record| record.kind)
      .collect();
    assert_eq!(
      kinds,
      vec![NotificationKind::SessionStart, NotificationKind::SessionStop]
    );
  }

  #[test]
  fn consecutive_detections_trip_alert_and_fan_out() {
    let notify: &'static RecordingNotify = Box::leak(Box::new(RecordingNotify::default()));
    let sms: &'static RecordingSms = Box::leak(Box::new(RecordingSms::default()));
    let dispatcher = AlertDispatcher::new(notify, "u-1")
      .with_primary_contact("c-1")
      .with_sms(
        sms,
        SmsRoute {
          to: "+15550100".into(),
          from: "+15550111".into(),
        },
      );
    let classifier = WindowClassifier::<4, 4, _>::new(ConstBackend(0.9))
      .with_window_len(2)
      .with_warmup(Duration::from_secs(60));
    let (events_tx, events_rx) = mpsc::channel();
    let config = SessionConfig::remote("u-1")
      .with_threshold(0.5)
      .with_consecutive_limit(2)
      .with_interval(Duration::from_millis(5));

    let mut session = WatchSession::start(
      config,
      |_stop| {
        (0..200).map(|_| {
          std::thread::sleep(Duration::from_millis(2));
          StreamItem::Frame(frame())
        })
      },
      classifier,
      dispatcher,
      events_tx,
    );

    let mut saw_alert = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
      match events_rx.recv_timeout(Duration::from_millis(50)) {
        Ok(DetectorEvent::Alert(alert)) => {
          assert!(!alert.message.is_empty());
          saw_alert = true;
          break;
        }
        Ok(_) => {}
        Err(_) => {}
      }
    }
    session.stop();

    assert!(saw_alert, "应当在连续检出后触发警报");

    // 派发在分离线程上进行，稍等收端落盘
    let deadline = Instant::now() + Duration::from_secs(2);
    let delivered = loop {
      let sms_sent = *sms.sent.lock().unwrap();
      let contact_notified = notify.records.lock().unwrap().iter().any(|record| {
        record.kind == NotificationKind::SeizureAlert && record.user_id == "c-1"
      });
      if sms_sent >= 1 && contact_notified {
        break true;
      }
      if Instant::now() >= deadline {
        break false;
      }
      std::thread::sleep(Duration::from_millis(10));
    };
    assert!(delivered, "警报应当扇出到联系人通知与短信");
  }

  #[test]
  fn session_ids_are_unique() {
    let a = SessionState::new("u-1");
    let b = SessionState::new("u-1");
    assert_ne!(a.session_id(), b.session_id());
  }

  #[test]
  fn presets_match_detector_profiles() {
    let remote = SessionConfig::remote("u");
    assert_eq!(remote.threshold, 0.80);
    assert_eq!(remote.consecutive_limit, 3);
    assert_eq!(remote.interval, Duration::from_millis(5000));

    let local = SessionConfig::local("u");
    assert_eq!(local.threshold, 0.75);
    assert_eq!(local.interval, Duration::from_millis(100));
  }
}
