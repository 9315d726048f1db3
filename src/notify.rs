// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Slack notifications, grounded in `notify_slack.py`: Build posts a new
//! message per snapshot epoch and threads every subsequent status update
//! (Upload success/failure, Validate success/failure) as a reply on that
//! message's `thread_ts`. Reuses the already-present `reqwest` dependency
//! rather than pulling in a dedicated Slack SDK.

use serde::Deserialize;

/// Coarse status used only to pick an emoji prefix, matching the original's
/// `STATUS_EMOJI` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyStatus {
    Info,
    Success,
    Failure,
}

impl NotifyStatus {
    fn emoji(self) -> &'static str {
        match self {
            NotifyStatus::Info => ":information_source:",
            NotifyStatus::Success => ":white_check_mark:",
            NotifyStatus::Failure => ":x:",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatPostMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

/// A client over Slack's `chat.postMessage` Web API endpoint.
pub struct SlackNotifier {
    http: reqwest::Client,
    token: String,
    channel: String,
}

impl SlackNotifier {
    pub fn new(http: reqwest::Client, token: String, channel: String) -> Self {
        Self { http, token, channel }
    }

    /// Post a new top-level message and return its `ts`, to be passed as
    /// `thread_ts` on every later reply about the same snapshot.
    pub async fn post(&self, status: NotifyStatus, text: &str) -> anyhow::Result<String> {
        self.send(status, text, None).await
    }

    /// Reply in an existing thread.
    pub async fn reply(&self, status: NotifyStatus, text: &str, thread_ts: &str) -> anyhow::Result<String> {
        self.send(status, text, Some(thread_ts)).await
    }

    async fn send(&self, status: NotifyStatus, text: &str, thread_ts: Option<&str>) -> anyhow::Result<String> {
        let mut body = serde_json::json!({
            "channel": self.channel,
            "text": format!("{} {text}", status.emoji()),
        });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = serde_json::Value::String(ts.to_owned());
        }

        let resp: ChatPostMessageResponse = self
            .http
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            anyhow::bail!(
                "slack chat.postMessage failed: {}",
                resp.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        resp.ts.ok_or_else(|| anyhow::anyhow!("slack response missing ts"))
    }
}

/// A notifier that's simply absent when no Slack token is configured —
/// workers hold an `Option<SlackNotifier>` rather than threading a feature
/// flag through every call site.
pub async fn maybe_post(
    notifier: Option<&SlackNotifier>,
    status: NotifyStatus,
    text: &str,
) -> anyhow::Result<Option<String>> {
    match notifier {
        Some(n) => Ok(Some(n.post(status, text).await?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emoji_mapping_matches_original_status_table() {
        assert_eq!(NotifyStatus::Success.emoji(), ":white_check_mark:");
        assert_eq!(NotifyStatus::Failure.emoji(), ":x:");
        assert_eq!(NotifyStatus::Info.emoji(), ":information_source:");
    }
}
