// 该文件是 Shouye （守夜） 项目的一部分。
// src/bin/watch.rs - 持续检测主程序
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

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shouye::{
  FromUrl,
  input::{InputWrapper, StreamStatus},
  model::{OnnxClassifierBuilder, PadPolicy, WindowClassifier},
  output::{AlertDispatcher, FolderNotify, SmsRoute, SmsWebhook},
  session::{DetectorEvent, SessionConfig, WatchSession},
};

/// 模型输入边长
const INPUT_EDGE: u32 = 224;

/// Shouye 持续检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源（http(s):// MJPEG 流、v4l:// 摄像头、frames:// 帧目录）
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 分类模型（onnx:///path/to/model.onnx）
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 通知记录输出（folder:///var/lib/shouye/notify）
  #[arg(long, value_name = "NOTIFY")]
  pub notify: Url,

  /// 短信网关（sms://gateway.example.com/send，可选）
  #[arg(long, value_name = "SMS")]
  pub sms: Option<Url>,

  /// 用户标识
  #[arg(long, value_name = "USER")]
  pub user: String,

  /// 主要联系人标识（可选，同样收到通知记录）
  #[arg(long, value_name = "CONTACT")]
  pub contact: Option<String>,

  /// 短信收信号码
  #[arg(long, value_name = "NUMBER")]
  pub sms_to: Option<String>,

  /// 短信发信号码
  #[arg(long, value_name = "NUMBER")]
  pub sms_from: Option<String>,

  /// 本地摄像头模式预设（阈值 0.75，节拍 100 毫秒）
  #[arg(long)]
  pub local: bool,

  /// 置信度阈值覆盖 (0.0 - 1.0)
  #[arg(long, value_name = "THRESHOLD")]
  pub threshold: Option<f32>,

  /// 连续检出次数覆盖
  #[arg(long, value_name = "COUNT")]
  pub limit: Option<u32>,

  /// 推理节拍覆盖（毫秒）
  #[arg(long, value_name = "MS")]
  pub interval_ms: Option<u64>,

  /// 窗口不满时跳过推理（默认零填充补满）
  #[arg(long)]
  pub skip_partial: bool,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("模型: {}", args.model);
  info!("通知输出: {}", args.notify);

  let mut config = if args.local {
    SessionConfig::local(args.user.clone())
  } else {
    SessionConfig::remote(args.user.clone())
  };
  if let Some(threshold) = args.threshold {
    config = config.with_threshold(threshold);
  }
  if let Some(limit) = args.limit {
    config = config.with_consecutive_limit(limit);
  }
  if let Some(ms) = args.interval_ms {
    config = config.with_interval(Duration::from_millis(ms));
  }
  if args.skip_partial {
    config = config.with_pad_policy(PadPolicy::Skip);
  }

  info!("正在加载模型...");
  let backend = OnnxClassifierBuilder::from_url(&args.model)?.build()?;
  let classifier = WindowClassifier::<INPUT_EDGE, INPUT_EDGE, _>::new(backend);

  let notify = FolderNotify::from_url(&args.notify)?;
  let mut dispatcher: AlertDispatcher<FolderNotify, SmsWebhook> =
    AlertDispatcher::new(notify, args.user.clone());
  if let Some(contact) = &args.contact {
    dispatcher = dispatcher.with_primary_contact(contact.clone());
  }
  match (&args.sms, &args.sms_to, &args.sms_from) {
    (Some(sms), Some(to), Some(from)) => {
      let sender = SmsWebhook::from_url(sms)?;
      dispatcher = dispatcher.with_sms(
        sender,
        SmsRoute {
          to: to.clone(),
          from: from.clone(),
        },
      );
    }
    (Some(_), _, _) => warn!("缺少 --sms-to/--sms-from，短信通道未启用"),
    _ => {}
  }

  let input = InputWrapper::from_url(&args.input)?;
  let (events_tx, events_rx) = mpsc::channel();
  let mut session = WatchSession::start(
    config,
    move |stop| {
      let mut input = input;
      input.bind_stop(stop);
      input
    },
    classifier,
    dispatcher,
    events_tx,
  );

  let (sig_tx, sig_rx) = mpsc::channel();
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = sig_tx.send(());
    std::thread::spawn(|| {
      std::thread::sleep(Duration::from_secs(30));
      warn!("强制退出程序");
      std::process::exit(1);
    });
  })
  .expect("Error setting Ctrl-C handler");

  loop {
    if sig_rx.try_recv().is_ok() {
      session.stop();
    }
    match events_rx.recv_timeout(Duration::from_millis(200)) {
      Ok(DetectorEvent::Status(status)) => {
        info!("状态: {}", status);
        if status == StreamStatus::Disconnected {
          warn!("流已断开，会话不会自动重启");
          session.stop();
        }
      }
      Ok(DetectorEvent::Prediction(prediction)) => {
        info!(
          "预测: {:?} 置信度 {:.2}",
          prediction.label, prediction.confidence
        );
      }
      Ok(DetectorEvent::Alert(alert)) => {
        warn!("警报: {}", alert.message);
      }
      Ok(DetectorEvent::Stopped) => break,
      Err(RecvTimeoutError::Timeout) => {}
      Err(RecvTimeoutError::Disconnected) => break,
    }
  }

  info!("会话结束");
  Ok(())
}
