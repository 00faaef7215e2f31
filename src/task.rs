// 该文件是 Shouye （守夜） 项目的一部分。
// src/task.rs - 推理调度循环
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

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::frame::{FrameWindow, RgbNhwcFrame};
use crate::model::{ClassifierBackend, WindowClassifier};
use crate::output::{AlertDispatcher, Notify, SendSms};
use crate::policy::AlertPolicy;
use crate::session::{DetectorEvent, SessionState};
use crate::slot::FrameSlot;

/// 固定节拍运行 `tick`，直到 `tick` 返回 true 或停止通道来消息。
///
/// 截止时刻按 `next_tick += interval` 推进，睡眠取
/// `max(0, next_tick - now)`：一次推理拖过了节拍，下一拍立即触发，
/// 累计漂移被限制在一个节拍以内，而不是简单的"完成后再等一整拍"。
pub fn run_cadenced<F>(interval: Duration, stop: &Receiver<()>, mut tick: F)
where
  F: FnMut() -> bool,
{
  let mut next_tick = Instant::now() + interval;
  loop {
    let wait = next_tick.saturating_duration_since(Instant::now());
    match stop.recv_timeout(wait) {
      Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
      Err(RecvTimeoutError::Timeout) => {}
    }
    next_tick += interval;
    if tick() {
      break;
    }
  }
}

/// 推理消费循环
///
/// 每个节拍：从帧槽取走最新一帧并入窗，门槛满足时同步调用分类器，
/// 把结果交给警报策略并发布事件。分类调用在循环内同步执行，
/// 节拍之间不会重叠；分类器故障按"本拍无结果"处理，不碰连击计数、
/// 不停循环。
pub struct WatchLoop<const W: u32, const H: u32, B, N, S> {
  pub slot: Arc<FrameSlot<RgbNhwcFrame<W, H>>>,
  pub classifier: WindowClassifier<W, H, B>,
  pub policy: AlertPolicy,
  pub dispatcher: AlertDispatcher<N, S>,
  pub events: Sender<DetectorEvent>,
  pub state: Arc<SessionState>,
  pub interval: Duration,
  pub stop: Receiver<()>,
}

impl<const W: u32, const H: u32, B, N, S> WatchLoop<W, H, B, N, S>
where
  B: ClassifierBackend,
  N: Notify + Send + Sync + 'static,
  S: SendSms + Send + Sync + 'static,
{
  pub fn run(self) {
    let WatchLoop {
      slot,
      mut classifier,
      mut policy,
      dispatcher,
      events,
      state,
      interval,
      stop,
    } = self;

    let mut window = FrameWindow::new(classifier.window_len());
    info!("推理循环启动，节拍 {:?}", interval);

    run_cadenced(interval, &stop, || {
      if let Some(frame) = slot.take_if_present() {
        window.push(frame);
      }

      match classifier.classify(&window) {
        Ok(Some(prediction)) => {
          window.clear();
          let alert = policy.observe(&prediction);
          state.set_consecutive(policy.consecutive());
          let _ = events.send(DetectorEvent::Prediction(prediction));
          if let Some(alert) = alert {
            warn!("触发警报: {}", alert.message);
            dispatcher.dispatch_alert(&alert);
            let _ = events.send(DetectorEvent::Alert(alert));
          }
        }
        Ok(None) => {}
        Err(e) => {
          // 本拍无结果，循环继续
          error!("分类器错误: {}", e);
        }
      }

      false
    });

    info!("推理循环退出");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::mpsc;
  use std::thread;

  #[test]
  fn ticks_follow_cadence_when_work_is_fast() {
    let (_tx, rx) = mpsc::channel::<()>();
    let mut ticks = 0u32;
    let start = Instant::now();

    run_cadenced(Duration::from_millis(20), &rx, || {
      ticks += 1;
      ticks >= 5
    });

    let elapsed = start.elapsed();
    assert_eq!(ticks, 5);
    // 5 个节拍，每拍 20ms
    assert!(elapsed >= Duration::from_millis(90), "elapsed: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(400), "elapsed: {:?}", elapsed);
  }

  #[test]
  fn slow_tick_makes_next_tick_fire_immediately() {
    let (_tx, rx) = mpsc::channel::<()>();
    let mut ticks = 0u32;
    let start = Instant::now();

    run_cadenced(Duration::from_millis(10), &rx, || {
      ticks += 1;
      thread::sleep(Duration::from_millis(25));
      ticks >= 5
    });

    let elapsed = start.elapsed();
    // 简单的"完成后再等一整拍"需要约 5*(10+25)=175ms；
    // 截止时刻自校正后约 10+5*25=135ms，漂移不超过一个节拍
    assert_eq!(ticks, 5);
    assert!(elapsed < Duration::from_millis(170), "elapsed: {:?}", elapsed);
  }

  #[test]
  fn stop_message_ends_loop_without_next_tick() {
    let (tx, rx) = mpsc::channel::<()>();
    tx.send(()).unwrap();
    let mut ticks = 0u32;

    run_cadenced(Duration::from_millis(5), &rx, || {
      ticks += 1;
      false
    });

    assert_eq!(ticks, 0);
  }

  #[test]
  fn dropped_stop_sender_ends_loop() {
    let (tx, rx) = mpsc::channel::<()>();
    drop(tx);
    let mut ticks = 0u32;

    run_cadenced(Duration::from_millis(5), &rx, || {
      ticks += 1;
      false
    });

    assert_eq!(ticks, 0);
  }
}
