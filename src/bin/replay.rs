// 该文件是 Shouye （守夜） 项目的一部分。
// src/bin/replay.rs - 录像帧离线回放评估
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

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shouye::{
  FromUrl,
  frame::FrameWindow,
  input::{ImageDirInput, StreamItem},
  model::{OnnxClassifierBuilder, WindowClassifier},
  policy::AlertPolicy,
};

const INPUT_EDGE: u32 = 224;

/// Shouye 离线回放参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 帧目录（frames:///path/to/frames）
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 分类模型（onnx:///path/to/model.onnx）
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.8", value_name = "THRESHOLD")]
  pub threshold: f32,

  /// 连续检出次数
  #[arg(long, default_value = "3", value_name = "COUNT")]
  pub limit: u32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("帧目录: {}", args.input);
  info!("模型: {}", args.model);

  info!("正在加载模型...");
  let backend = OnnxClassifierBuilder::from_url(&args.model)?.build()?;
  // 回放不受节拍驱动，只在满窗时推理
  let mut classifier =
    WindowClassifier::<INPUT_EDGE, INPUT_EDGE, _>::new(backend).with_warmup(Duration::MAX);
  let mut policy = AlertPolicy::new(args.threshold, args.limit, "replay");

  let input = ImageDirInput::from_url(&args.input)?;
  let mut window = FrameWindow::new(classifier.window_len());
  let mut predictions = 0usize;
  let mut alerts = 0usize;

  for item in input {
    let frame = match item {
      StreamItem::Frame(frame) => frame,
      StreamItem::Status(status) => {
        info!("状态: {}", status);
        continue;
      }
    };

    window.push(frame);
    if !window.is_full() {
      continue;
    }

    if let Some(prediction) = classifier.classify(&window)? {
      window.clear();
      predictions += 1;
      info!(
        "预测: {:?} 置信度 {:.2}",
        prediction.label, prediction.confidence
      );
      if let Some(alert) = policy.observe(&prediction) {
        alerts += 1;
        warn!("警报: {}", alert.message);
      }
    }
  }

  info!("回放完成: {} 次推理, {} 次警报", predictions, alerts);
  Ok(())
}
