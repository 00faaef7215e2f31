// 该文件是 Shouye （守夜） 项目的一部分。
// src/output/sms_webhook.rs - 短信网关输出
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

use serde_json::json;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::output::SendSms;
use crate::{FromUrl, FromUrlWithScheme};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum SmsWebhookError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("网关地址无效: {0}")]
  EndpointError(String),
  #[error("网关请求失败: {0}")]
  TransportError(String),
}

/// 短信网关输出
///
/// 向网关端点 POST 一条 `{to, from, body}` JSON，每次警报一条，
/// 不重试；2xx 之外的响应视为网关拒绝（返回 `false`），
/// 传输层故障作为错误上报。
///
/// URL 形如 `sms://gateway.example.com/v1/send?token=...`，
/// 会被改写为 `https://` 端点；加 `plain=1` 走 `http://`（本地网关）。
pub struct SmsWebhook {
  endpoint: Url,
  agent: ureq::Agent,
}

impl FromUrlWithScheme for SmsWebhook {
  const SCHEME: &'static str = "sms";
}

impl FromUrl for SmsWebhook {
  type Error = SmsWebhookError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SmsWebhookError::SchemeMismatch);
    }

    let plain = url.query_pairs().any(|(key, _)| key == "plain");
    let scheme = if plain { "http" } else { "https" };

    let host = url
      .host_str()
      .ok_or_else(|| SmsWebhookError::EndpointError("缺少主机名".to_string()))?;
    let mut endpoint = format!("{}://{}", scheme, host);
    if let Some(port) = url.port() {
      endpoint.push_str(&format!(":{}", port));
    }
    endpoint.push_str(url.path());

    let mut endpoint =
      Url::parse(&endpoint).map_err(|e| SmsWebhookError::EndpointError(e.to_string()))?;
    {
      let mut pairs = endpoint.query_pairs_mut();
      for (key, value) in url.query_pairs() {
        if key != "plain" {
          pairs.append_pair(&key, &value);
        }
      }
    }
    if endpoint.query() == Some("") {
      endpoint.set_query(None);
    }

    let agent = ureq::AgentBuilder::new().timeout(SEND_TIMEOUT).build();

    Ok(SmsWebhook { endpoint, agent })
  }
}

impl SmsWebhook {
  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }
}

impl SendSms for SmsWebhook {
  type Error = SmsWebhookError;

  fn send_sms(&self, to: &str, from: &str, body: &str) -> Result<bool, Self::Error> {
    let payload = json!({
      "to": to,
      "from": from,
      "body": body,
    });

    match self
      .agent
      .post(self.endpoint.as_str())
      .set("Content-Type", "application/json")
      .send_string(&payload.to_string())
    {
      Ok(_) => Ok(true),
      Err(ureq::Error::Status(code, _)) => {
        warn!("短信网关返回 {}", code);
        Ok(false)
      }
      Err(e) => Err(SmsWebhookError::TransportError(e.to_string())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rewrites_sms_scheme_to_https_endpoint() {
    let url = Url::parse("sms://gateway.example.com/v1/send?token=abc").unwrap();
    let sink = SmsWebhook::from_url(&url).unwrap();

    assert_eq!(
      sink.endpoint().as_str(),
      "https://gateway.example.com/v1/send?token=abc"
    );
  }

  #[test]
  fn plain_flag_selects_http_and_is_stripped() {
    let url = Url::parse("sms://127.0.0.1:9777/send?plain=1").unwrap();
    let sink = SmsWebhook::from_url(&url).unwrap();

    assert_eq!(sink.endpoint().as_str(), "http://127.0.0.1:9777/send");
  }

  #[test]
  fn rejects_foreign_scheme() {
    let url = Url::parse("https://gateway.example.com/v1/send").unwrap();
    assert!(matches!(
      SmsWebhook::from_url(&url),
      Err(SmsWebhookError::SchemeMismatch)
    ));
  }
}
