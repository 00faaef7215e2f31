// 该文件是 Shouye （守夜） 项目的一部分。
// src/slot.rs - 最新帧交换槽
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

use std::sync::Mutex;

/// 单槽、后者胜出的帧交换点
///
/// 生产者（取流循环）与消费者（推理循环）之间唯一的共享可变资源。
/// 容量固定为 1：`publish` 原子地以新值覆盖旧值，未被消费的旧值立即释放，
/// 绝不排队。消费者只会看到最近一次发布的值，推理窗口因此反映当前画面
/// 而不是积压的历史。
#[derive(Debug, Default)]
pub struct FrameSlot<T> {
  cell: Mutex<Option<T>>,
}

impl<T> FrameSlot<T> {
  pub fn new() -> Self {
    Self {
      cell: Mutex::new(None),
    }
  }

  /// 发布新值，覆盖并释放未消费的旧值。
  pub fn publish(&self, value: T) {
    let mut cell = self.cell.lock().unwrap();
    *cell = Some(value);
  }

  /// 原子地取走当前值；槽为空时返回 `None`。
  pub fn take_if_present(&self) -> Option<T> {
    let mut cell = self.cell.lock().unwrap();
    cell.take()
  }

  /// 清空槽，释放持有的值。
  pub fn clear(&self) {
    let mut cell = self.cell.lock().unwrap();
    *cell = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Tracked {
    id: u32,
    drops: Arc<AtomicUsize>,
  }

  impl Drop for Tracked {
    fn drop(&mut self) {
      self.drops.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[test]
  fn latest_publish_wins_and_old_values_are_released() {
    let drops = Arc::new(AtomicUsize::new(0));
    let slot = FrameSlot::new();

    for id in 1..=3 {
      slot.publish(Tracked {
        id,
        drops: drops.clone(),
      });
    }

    // F1 与 F2 在被覆盖时已释放，消费者只能看到 F3
    assert_eq!(drops.load(Ordering::SeqCst), 2);

    let taken = slot.take_if_present().unwrap();
    assert_eq!(taken.id, 3);

    assert!(slot.take_if_present().is_none());
  }

  #[test]
  fn take_on_empty_slot_returns_none() {
    let slot: FrameSlot<u8> = FrameSlot::new();
    assert!(slot.take_if_present().is_none());
  }

  #[test]
  fn clear_releases_held_value() {
    let drops = Arc::new(AtomicUsize::new(0));
    let slot = FrameSlot::new();
    slot.publish(Tracked {
      id: 1,
      drops: drops.clone(),
    });

    slot.clear();

    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert!(slot.take_if_present().is_none());
  }
}
