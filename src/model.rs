// 该文件是 Shouye （守夜） 项目的一部分。
// src/model.rs - 分类模型
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

use std::time::{Duration, Instant};

use crate::frame::FrameWindow;
use crate::input::AsNhwcFrame;

/// 默认推理窗口长度（帧数）
pub const WINDOW_LEN: usize = 10;
/// 默认成窗等待时间：首帧之后最多等这么久，不足一窗也触发推理
pub const WINDOW_WARMUP: Duration = Duration::from_secs(5);

/// 二分类标签
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeizureLabel {
  Seizure,
  NotSeizure,
}

/// 一次推理的结果
///
/// 每个成功产出窗口的调度节拍产生一个；不可变，交给警报策略消费，
/// 同时作为事件转发给展示层。
#[derive(Debug, Clone)]
pub struct Prediction {
  pub label: SeizureLabel,
  /// 所得标签的置信度，[0, 1]
  pub confidence: f32,
  /// 原始二元分数，下标 0 为 Seizure
  pub raw_scores: [f32; 2],
  /// 窗口覆盖的时间范围（Unix 毫秒）
  pub window_span: (i64, i64),
}

/// 不透明的分类推理后端
///
/// 输入为展平的 `[1, T, H, W, 3]` f32 张量（NHWC，逐帧归一化到 [0, 1]），
/// 输出二元分数（下标 0 为 Seizure），可以是概率也可以是 logits，
/// 适配层会按需做 softmax 归一化。推理运行时（ONNX、远程服务等）
/// 都在这道接缝后面替换，不触及调度与警报逻辑。
pub trait ClassifierBackend {
  type Error: std::error::Error + Send + Sync + 'static;

  fn run(&mut self, input: &[f32], shape: &[usize; 5]) -> Result<[f32; 2], Self::Error>;
}

/// 窗口不满时的处理策略
///
/// 参考实现用零帧补满窗口再推理；零帧可能让预测偏向某一类，
/// 因此这里做成显式配置：`Skip` 保留窗口继续积帧，本节拍不出结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadPolicy {
  #[default]
  ZeroPad,
  Skip,
}

/// 分类适配层
///
/// 接收定长帧窗口：归一化、按策略补零或跳过、调用后端、
/// 对 logits 做 softmax，产出 [`Prediction`]。
/// 数据门槛：窗口攒满之前且距首帧不足热身时间时不出结果。
pub struct WindowClassifier<const W: u32, const H: u32, B> {
  backend: B,
  window_len: usize,
  pad_policy: PadPolicy,
  warmup: Duration,
  first_seen: Option<Instant>,
}

impl<const W: u32, const H: u32, B: ClassifierBackend> WindowClassifier<W, H, B> {
  pub fn new(backend: B) -> Self {
    Self {
      backend,
      window_len: WINDOW_LEN,
      pad_policy: PadPolicy::default(),
      warmup: WINDOW_WARMUP,
      first_seen: None,
    }
  }

  pub fn with_pad_policy(mut self, pad_policy: PadPolicy) -> Self {
    self.pad_policy = pad_policy;
    self
  }

  pub fn with_window_len(mut self, window_len: usize) -> Self {
    self.window_len = window_len;
    self
  }

  pub fn with_warmup(mut self, warmup: Duration) -> Self {
    self.warmup = warmup;
    self
  }

  pub fn window_len(&self) -> usize {
    self.window_len
  }

  /// 对当前窗口做一次分类；门槛未到或按策略跳过时返回 `Ok(None)`。
  pub fn classify(
    &mut self,
    window: &FrameWindow<W, H>,
  ) -> Result<Option<Prediction>, B::Error> {
    if window.is_empty() {
      return Ok(None);
    }

    let first_seen = *self.first_seen.get_or_insert_with(Instant::now);
    if window.len() < self.window_len {
      if first_seen.elapsed() < self.warmup {
        return Ok(None);
      }
      if self.pad_policy == PadPolicy::Skip {
        return Ok(None);
      }
    }

    let (t, h, w) = (self.window_len, H as usize, W as usize);
    let frame_len = h * w * 3;
    // 缺帧位置保持 0.0，即零填充
    let mut input = vec![0f32; t * frame_len];
    for (index, frame) in window.frames().iter().take(t).enumerate() {
      let dst = &mut input[index * frame_len..(index + 1) * frame_len];
      for (d, s) in dst.iter_mut().zip(frame.as_nhwc()) {
        *d = *s as f32 / 255.0;
      }
    }

    let raw = self.backend.run(&input, &[1, t, h, w, 3])?;
    let scores = if is_distribution(&raw) {
      raw
    } else {
      softmax2(raw)
    };

    let (label, confidence) = if scores[0] >= scores[1] {
      (SeizureLabel::Seizure, scores[0])
    } else {
      (SeizureLabel::NotSeizure, scores[1])
    };

    Ok(Some(Prediction {
      label,
      confidence,
      raw_scores: scores,
      window_span: window.span().unwrap_or((0, 0)),
    }))
  }
}

fn is_distribution(scores: &[f32; 2]) -> bool {
  scores.iter().all(|s| (0.0..=1.0).contains(s)) && (scores[0] + scores[1] - 1.0).abs() < 1e-3
}

fn softmax2(scores: [f32; 2]) -> [f32; 2] {
  let max = scores[0].max(scores[1]);
  let e0 = (scores[0] - max).exp();
  let e1 = (scores[1] - max).exp();
  let sum = e0 + e1;
  [e0 / sum, e1 / sum]
}

#[cfg(feature = "onnx_model")]
mod onnx;
#[cfg(feature = "onnx_model")]
pub use self::onnx::{OnnxClassifier, OnnxClassifierBuilder, OnnxClassifierError};
