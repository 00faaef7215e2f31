// 该文件是 Shouye （守夜） 项目的一部分。
// src/output.rs - 警报输出
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
use std::thread;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use crate::policy::AlertEvent;

/// 通知记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
  SeizureAlert,
  SessionStart,
  SessionStop,
}

impl NotificationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      NotificationKind::SeizureAlert => "seizure_alert",
      NotificationKind::SessionStart => "session_start",
      NotificationKind::SessionStop => "session_stop",
    }
  }
}

/// 追加写入的通知记录
///
/// 每次警报、会话开始、会话结束各写一条；给用户一条，
/// 配置了主要联系人的再给联系人一条。
#[derive(Debug, Clone)]
pub struct NotificationRecord {
  pub user_id: String,
  pub title: String,
  pub message: String,
  pub kind: NotificationKind,
  pub timestamp_ms: i64,
  pub is_read: bool,
  pub metadata: serde_json::Value,
}

impl NotificationRecord {
  pub fn to_json(&self) -> serde_json::Value {
    json!({
      "userId": self.user_id,
      "title": self.title,
      "message": self.message,
      "type": self.kind.as_str(),
      "timestampMs": self.timestamp_ms,
      "isRead": self.is_read,
      "metadata": self.metadata,
    })
  }
}

/// 通知持久化接口
pub trait Notify {
  type Error: std::error::Error;
  fn notify(&self, record: &NotificationRecord) -> Result<(), Self::Error>;
}

/// 短信发送接口
///
/// 每次警报只调用一次，不重试；布尔返回值之外没有送达确认。
pub trait SendSms {
  type Error: std::error::Error;
  fn send_sms(&self, to: &str, from: &str, body: &str) -> Result<bool, Self::Error>;
}

#[cfg(feature = "folder_notify")]
mod folder_notify;
#[cfg(feature = "folder_notify")]
pub use self::folder_notify::{FolderNotify, FolderNotifyError};

#[cfg(feature = "sms_webhook")]
mod sms_webhook;
#[cfg(feature = "sms_webhook")]
pub use self::sms_webhook::{SmsWebhook, SmsWebhookError};

/// 短信收发号码
#[derive(Debug, Clone)]
pub struct SmsRoute {
  pub to: String,
  pub from: String,
}

/// 警报派发器
///
/// 警报触发后扇出到通知持久化与短信两路收端。两路彼此独立、
/// 尽力而为：失败记日志、不重试、互不回滚；派发在分离线程上进行，
/// 绝不阻塞取流与推理循环。
pub struct AlertDispatcher<N, S> {
  notify: Arc<N>,
  sms: Option<(Arc<S>, SmsRoute)>,
  user_id: String,
  primary_contact: Option<String>,
}

impl<N, S> Clone for AlertDispatcher<N, S> {
  fn clone(&self) -> Self {
    Self {
      notify: self.notify.clone(),
      sms: self.sms.clone(),
      user_id: self.user_id.clone(),
      primary_contact: self.primary_contact.clone(),
    }
  }
}

impl<N, S> AlertDispatcher<N, S>
where
  N: Notify + Send + Sync + 'static,
  S: SendSms + Send + Sync + 'static,
{
  pub fn new(notify: N, user_id: impl Into<String>) -> Self {
    Self {
      notify: Arc::new(notify),
      sms: None,
      user_id: user_id.into(),
      primary_contact: None,
    }
  }

  pub fn with_primary_contact(mut self, contact_id: impl Into<String>) -> Self {
    self.primary_contact = Some(contact_id.into());
    self
  }

  pub fn with_sms(mut self, sender: S, route: SmsRoute) -> Self {
    self.sms = Some((Arc::new(sender), route));
    self
  }

  /// 派发一次警报：通知记录 + 短信，分离线程上尽力而为。
  pub fn dispatch_alert(&self, event: &AlertEvent) {
    let records = self.records(
      NotificationKind::SeizureAlert,
      "疑似癫痫发作警报",
      &event.message,
      json!({
        "sessionId": event.session_id,
        "windowStartMs": event.window_span.0,
        "windowEndMs": event.window_span.1,
      }),
    );
    let notify = self.notify.clone();
    let sms = self.sms.clone();
    let body = event.message.clone();

    thread::spawn(move || {
      for record in &records {
        match notify.notify(record) {
          Ok(()) => info!("通知记录已写入: {}", record.user_id),
          Err(e) => error!("通知记录写入失败: {}", e),
        }
      }

      if let Some((sender, route)) = sms {
        match sender.send_sms(&route.to, &route.from, &body) {
          Ok(true) => info!("短信已发送至 {}", route.to),
          Ok(false) => warn!("短信网关拒绝发送"),
          Err(e) => error!("短信发送失败: {}", e),
        }
      }
    });
  }

  /// 写会话开始/结束记录；失败只记日志。
  pub fn announce(&self, kind: NotificationKind, session_id: &str, message: &str) {
    let title = match kind {
      NotificationKind::SessionStart => "检测会话已开始",
      NotificationKind::SessionStop => "检测会话已结束",
      NotificationKind::SeizureAlert => "疑似癫痫发作警报",
    };
    let records = self.records(kind, title, message, json!({ "sessionId": session_id }));
    for record in &records {
      if let Err(e) = self.notify.notify(record) {
        error!("通知记录写入失败: {}", e);
      }
    }
  }

  fn records(
    &self,
    kind: NotificationKind,
    title: &str,
    message: &str,
    metadata: serde_json::Value,
  ) -> Vec<NotificationRecord> {
    let timestamp_ms = Utc::now().timestamp_millis();
    let mut recipients = vec![self.user_id.clone()];
    recipients.extend(self.primary_contact.clone());

    recipients
      .into_iter()
      .map(|user_id| NotificationRecord {
        user_id,
        title: title.to_string(),
        message: message.to_string(),
        kind,
        timestamp_ms,
        is_read: false,
        metadata: metadata.clone(),
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;
  use std::time::{Duration, Instant};

  #[derive(Debug, thiserror::Error)]
  #[error("sink failure")]
  struct SinkFailure;

  #[derive(Default)]
  struct RecordingNotify {
    records: Mutex<Vec<NotificationRecord>>,
    fail: bool,
  }

  impl Notify for &'static RecordingNotify {
    type Error = SinkFailure;

    fn notify(&self, record: &NotificationRecord) -> Result<(), Self::Error> {
      if self.fail {
        return Err(SinkFailure);
      }
      self.records.lock().unwrap().push(record.clone());
      Ok(())
    }
  }

  #[derive(Default)]
  struct RecordingSms {
    sent: Mutex<Vec<(String, String, String)>>,
  }

  impl SendSms for &'static RecordingSms {
    type Error = SinkFailure;

    fn send_sms(&self, to: &str, from: &str, body: &str) -> Result<bool, Self::Error> {
      self
        .sent
        .lock()
        .unwrap()
        .push((to.to_string(), from.to_string(), body.to_string()));
      Ok(true)
    }
  }

  fn event() -> AlertEvent {
    AlertEvent {
      session_id: "s-1".into(),
      message: "检测到疑似癫痫发作（置信度 90%）".into(),
      window_span: (100, 200),
      timestamp_ms: 300,
    }
  }

  fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
      if done() {
        return true;
      }
      thread::sleep(Duration::from_millis(10));
    }
    false
  }

  #[test]
  fn record_json_matches_sink_contract() {
    let record = NotificationRecord {
      user_id: "u-1".into(),
      title: "t".into(),
      message: "m".into(),
      kind: NotificationKind::SeizureAlert,
      timestamp_ms: 42,
      is_read: false,
      metadata: json!({"sessionId": "s-1"}),
    };
    let value = record.to_json();

    assert_eq!(value["userId"], "u-1");
    assert_eq!(value["type"], "seizure_alert");
    assert_eq!(value["timestampMs"], 42);
    assert_eq!(value["isRead"], false);
    assert_eq!(value["metadata"]["sessionId"], "s-1");
  }

  #[test]
  fn alert_fans_out_to_user_contact_and_sms() {
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

    dispatcher.dispatch_alert(&event());

    assert!(wait_until(Duration::from_secs(2), || {
      notify.records.lock().unwrap().len() == 2 && sms.sent.lock().unwrap().len() == 1
    }));

    let records = notify.records.lock().unwrap();
    let recipients: Vec<_> = records.iter().map(|r| r.user_id.clone()).collect();
    assert_eq!(recipients, vec!["u-1", "c-1"]);
    assert!(records.iter().all(|r| !r.is_read));

    let sent = sms.sent.lock().unwrap();
    assert_eq!(sent[0].0, "+15550100");
  }

  #[test]
  fn sms_still_sent_when_notification_sink_fails() {
    let notify: &'static RecordingNotify = Box::leak(Box::new(RecordingNotify {
      fail: true,
      ..Default::default()
    }));
    let sms: &'static RecordingSms = Box::leak(Box::new(RecordingSms::default()));

    let dispatcher = AlertDispatcher::new(notify, "u-1").with_sms(
      sms,
      SmsRoute {
        to: "+15550100".into(),
        from: "+15550111".into(),
      },
    );

    dispatcher.dispatch_alert(&event());

    assert!(wait_until(Duration::from_secs(2), || {
      sms.sent.lock().unwrap().len() == 1
    }));
    assert!(notify.records.lock().unwrap().is_empty());
  }

  #[test]
  fn announce_writes_session_records_inline() {
    let notify: &'static RecordingNotify = Box::leak(Box::new(RecordingNotify::default()));

    let dispatcher: AlertDispatcher<_, &'static RecordingSms> =
      AlertDispatcher::new(notify, "u-1").with_primary_contact("c-1");

    dispatcher.announce(NotificationKind::SessionStart, "s-1", "检测已开始");

    let records = notify.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].kind, NotificationKind::SessionStart);
  }
}
