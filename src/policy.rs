// 该文件是 Shouye （守夜） 项目的一部分。
// src/policy.rs - 警报去抖策略
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
use tracing::debug;

use crate::model::{Prediction, SeizureLabel};

/// 触发警报时产生的事件
///
/// 由策略在连击达到上限时创建，交给派发器消费一次后丢弃；
/// 派发失败只上报，核心不重试。
#[derive(Debug, Clone)]
pub struct AlertEvent {
  pub session_id: String,
  pub message: String,
  /// 触发窗口覆盖的时间范围（Unix 毫秒）
  pub window_span: (i64, i64),
  pub timestamp_ms: i64,
}

/// 连续检出去抖状态机
///
/// 严格连击计数：标签为 Seizure 且置信度达到阈值则加一，
/// 任何一次阴性或低于阈值的结果都无条件清零，没有衰减容忍。
/// 连击达到上限时发出恰好一个 [`AlertEvent`] 并立即清零。
#[derive(Debug)]
pub struct AlertPolicy {
  threshold: f32,
  limit: u32,
  consecutive: u32,
  session_id: String,
}

impl AlertPolicy {
  pub fn new(threshold: f32, limit: u32, session_id: impl Into<String>) -> Self {
    Self {
      threshold,
      limit,
      consecutive: 0,
      session_id: session_id.into(),
    }
  }

  /// 观察一次推理结果；连击触顶时返回警报事件。
  pub fn observe(&mut self, prediction: &Prediction) -> Option<AlertEvent> {
    let positive =
      prediction.label == SeizureLabel::Seizure && prediction.confidence >= self.threshold;

    if !positive {
      self.consecutive = 0;
      return None;
    }

    self.consecutive += 1;
    debug!(
      "疑似检出 {}/{}（置信度 {:.2}）",
      self.consecutive, self.limit, prediction.confidence
    );

    if self.consecutive < self.limit {
      return None;
    }

    self.consecutive = 0;
    Some(AlertEvent {
      session_id: self.session_id.clone(),
      message: format!(
        "检测到疑似癫痫发作（置信度 {:.0}%）",
        prediction.confidence * 100.0
      ),
      window_span: prediction.window_span,
      timestamp_ms: Utc::now().timestamp_millis(),
    })
  }

  pub fn consecutive(&self) -> u32 {
    self.consecutive
  }

  pub fn reset(&mut self) {
    self.consecutive = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn prediction(label: SeizureLabel, confidence: f32) -> Prediction {
    let raw_scores = match label {
      SeizureLabel::Seizure => [confidence, 1.0 - confidence],
      SeizureLabel::NotSeizure => [1.0 - confidence, confidence],
    };
    Prediction {
      label,
      confidence,
      raw_scores,
      window_span: (0, 1000),
    }
  }

  #[test]
  fn negative_result_resets_streak_and_alert_fires_once() {
    let mut policy = AlertPolicy::new(0.8, 3, "s-1");
    let sequence = [
      prediction(SeizureLabel::Seizure, 0.9),
      prediction(SeizureLabel::Seizure, 0.85),
      prediction(SeizureLabel::NotSeizure, 0.6),
      prediction(SeizureLabel::Seizure, 0.9),
      prediction(SeizureLabel::Seizure, 0.9),
      prediction(SeizureLabel::Seizure, 0.9),
    ];

    let mut alerts = Vec::new();
    for (index, p) in sequence.iter().enumerate() {
      if let Some(alert) = policy.observe(p) {
        alerts.push(index);
      }
    }

    // 第 3 条阴性清零连击，警报只在第 6 条之后触发一次
    assert_eq!(alerts, vec![5]);
  }

  #[test]
  fn sub_threshold_positive_counts_as_negative() {
    let mut policy = AlertPolicy::new(0.8, 3, "s-1");

    assert!(policy.observe(&prediction(SeizureLabel::Seizure, 0.9)).is_none());
    assert_eq!(policy.consecutive(), 1);

    // 0.79 低于阈值，等同阴性
    assert!(
      policy
        .observe(&prediction(SeizureLabel::Seizure, 0.79))
        .is_none()
    );
    assert_eq!(policy.consecutive(), 0);
  }

  #[test]
  fn threshold_is_inclusive() {
    let mut policy = AlertPolicy::new(0.8, 2, "s-1");

    assert!(policy.observe(&prediction(SeizureLabel::Seizure, 0.8)).is_none());
    let alert = policy.observe(&prediction(SeizureLabel::Seizure, 0.8));

    assert!(alert.is_some());
  }

  #[test]
  fn counter_restarts_after_trip() {
    let mut policy = AlertPolicy::new(0.8, 2, "s-9");

    assert!(policy.observe(&prediction(SeizureLabel::Seizure, 0.9)).is_none());
    let alert = policy.observe(&prediction(SeizureLabel::Seizure, 0.9)).unwrap();
    assert_eq!(alert.session_id, "s-9");
    assert_eq!(policy.consecutive(), 0);

    // 触发后重新积累，需要再攒满一轮
    assert!(policy.observe(&prediction(SeizureLabel::Seizure, 0.9)).is_none());
    assert!(policy.observe(&prediction(SeizureLabel::Seizure, 0.9)).is_some());
  }
}
