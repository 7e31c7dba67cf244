use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::Notifier;
use crate::backends::ParameterStore;
use crate::config::SlackConfig;
use crate::error::{Result, RotationError};
use crate::events::{EventKind, RotationEvent};

pub const SLACK_USERNAME: &str = "AWS SecretsManager";
pub const SLACK_ICON: &str = ":aws_logo:";

/// Incoming-webhook message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlackMessage {
    pub channel: String,
    pub icon_emoji: String,
    pub username: String,
    pub text: String,
}

/// Posts rotation outcomes to a Slack incoming webhook
pub struct SlackNotifier {
    client: Client,
    base_url: String,
    webhook_id: String,
    channel: String,
    /// account id -> friendly name
    aliases: BTreeMap<String, String>,
}

impl SlackNotifier {
    /// `host` is a bare hostname (`hooks.slack.com`) or a full base URL
    pub fn new(host: &str, webhook_id: impl Into<String>, channel: impl Into<String>) -> Self {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };

        Self {
            client: Client::new(),
            base_url,
            webhook_id: webhook_id.into().trim_matches('/').to_string(),
            channel: channel.into(),
            aliases: BTreeMap::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: BTreeMap<String, String>) -> Self {
        self.aliases = aliases;
        self
    }

    /// Build from configuration, fetching the host and webhook id from the
    /// parameter store when they are given by parameter name
    pub async fn from_config(
        config: &SlackConfig,
        aliases: BTreeMap<String, String>,
        params: &dyn ParameterStore,
    ) -> Result<Self> {
        let host = match &config.host_ssm_name {
            Some(name) => params.get(name).await?,
            None => config.host.clone(),
        };
        let webhook_id = match (&config.webhook_id, &config.webhook_ssm_name) {
            (Some(id), _) if !id.trim().is_empty() => id.clone(),
            (_, Some(name)) => params.get(name).await?,
            _ => {
                return Err(RotationError::config(
                    "slack needs either webhook_id or webhook_ssm_name",
                ))
            }
        };
        debug!("Slack notifications go to {} on {}", config.channel, host);

        Ok(Self::new(&host, webhook_id, config.channel.clone()).with_aliases(aliases))
    }

    pub fn account_name(&self, account: Option<&str>) -> String {
        match account {
            Some(id) => self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string()),
            None => "unknown account".to_string(),
        }
    }

    pub fn message(&self, event: &RotationEvent) -> SlackMessage {
        let account = self.account_name(event.account.as_deref());
        let text = match event.kind() {
            EventKind::RotationFailed => format!(
                "❌ Periodic JWT key generation *failed* in `{}` for secret `{}`",
                account, event.secret_id
            ),
            EventKind::RotationSucceeded => format!(
                "✅ Periodic JWT key generation *succeeded* in `{}` for secret `{}`",
                account, event.secret_id
            ),
        };

        SlackMessage {
            channel: self.channel.clone(),
            icon_emoji: SLACK_ICON.to_string(),
            username: SLACK_USERNAME.to_string(),
            text,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, event: &RotationEvent) -> Result<()> {
        let url = format!("{}/services/{}", self.base_url, self.webhook_id);
        let message = self.message(event);

        let response = self
            .client
            .post(&url)
            .json(&message)
            .send()
            .await
            .map_err(|e| RotationError::Notification(format!("Failed to reach Slack: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RotationError::Notification(format!(
                "Slack webhook returned {}: {}",
                status, body
            )));
        }

        info!("Sent {} for {} to Slack", event.kind(), event.secret_id);
        Ok(())
    }

    fn channel_name(&self) -> &str {
        &self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryParameterStore;
    use mockito::Matcher;
    use serde_json::json;

    fn aliases() -> BTreeMap<String, String> {
        let mut aliases = BTreeMap::new();
        aliases.insert("472057503814".to_string(), "prod".to_string());
        aliases
    }

    #[test]
    fn test_message_uses_alias() {
        let notifier = SlackNotifier::new("hooks.slack.com", "T0/B0/X", "#biobots").with_aliases(aliases());
        let event = RotationEvent::failed("IcaJwt", &RotationError::config("x")).with_account("472057503814");

        let message = notifier.message(&event);
        assert_eq!(message.channel, "#biobots");
        assert_eq!(message.username, "AWS SecretsManager");
        assert_eq!(message.icon_emoji, ":aws_logo:");
        assert_eq!(
            message.text,
            "❌ Periodic JWT key generation *failed* in `prod` for secret `IcaJwt`"
        );
    }

    #[test]
    fn test_message_unknown_account_falls_back_to_id() {
        let notifier = SlackNotifier::new("hooks.slack.com", "T0/B0/X", "#biobots");
        let event = RotationEvent::succeeded("IcaJwt").with_account("843407916570");
        assert_eq!(
            notifier.message(&event).text,
            "✅ Periodic JWT key generation *succeeded* in `843407916570` for secret `IcaJwt`"
        );
    }

    #[tokio::test]
    async fn test_notify_posts_to_webhook() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/services/T0/B0/X")
            .match_header("content-type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "channel": "#biobots",
                "username": "AWS SecretsManager",
                "icon_emoji": ":aws_logo:"
            })))
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let notifier = SlackNotifier::new(&server.url(), "T0/B0/X", "#biobots");
        notifier
            .notify(&RotationEvent::succeeded("IcaJwt"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_notify_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/services/T0/B0/X")
            .with_status(404)
            .with_body("no_service")
            .create_async()
            .await;

        let notifier = SlackNotifier::new(&server.url(), "T0/B0/X", "#biobots");
        let err = notifier
            .notify(&RotationEvent::succeeded("IcaJwt"))
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::Notification(_)));
    }

    #[tokio::test]
    async fn test_from_config_resolves_parameters() {
        let params = MemoryParameterStore::with([
            ("/slack/host".to_string(), "hooks.example.com".to_string()),
            ("/slack/webhook".to_string(), "T1/B1/Y".to_string()),
        ]);
        let config = SlackConfig {
            host: "hooks.slack.com".to_string(),
            host_ssm_name: Some("/slack/host".to_string()),
            webhook_id: None,
            webhook_ssm_name: Some("/slack/webhook".to_string()),
            channel: "#alerts".to_string(),
        };

        let notifier = SlackNotifier::from_config(&config, BTreeMap::new(), &params)
            .await
            .unwrap();
        assert_eq!(notifier.base_url, "https://hooks.example.com");
        assert_eq!(notifier.webhook_id, "T1/B1/Y");
        assert_eq!(notifier.channel_name(), "#alerts");
    }

    #[tokio::test]
    async fn test_from_config_requires_webhook() {
        let config = SlackConfig {
            host: "hooks.slack.com".to_string(),
            host_ssm_name: None,
            webhook_id: None,
            webhook_ssm_name: None,
            channel: "#alerts".to_string(),
        };
        let err = SlackNotifier::from_config(&config, BTreeMap::new(), &MemoryParameterStore::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RotationError::Config(_)));
    }
}
