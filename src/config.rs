use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::events::{EventFilter, EventKind};
use crate::scheduler::{Schedule, SchedulerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackConfig>,
    #[serde(default)]
    pub integrations: Vec<IntegrationConfig>,
    #[serde(default)]
    pub syncs: Vec<SyncConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// account id -> friendly name used in notifications
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_invocation_timeout")]
    pub invocation_timeout_seconds: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_slack_host")]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_ssm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_ssm_name: Option<String>,
    pub channel: String,
}

/// One master/derived secret pair and everything around it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub name: String,
    pub master_secret: String,
    pub derived_secret: String,
    /// 0 rotates on demand only
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_hours: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotator_role_arn: Option<String>,
    /// Function the secret store invokes for store-driven rotation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotator_function_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collector_role_arn: Option<String>,
    #[serde(default)]
    pub consumer_role_arns: Vec<String>,
    #[serde(default = "default_notify_on")]
    pub notify_on: Vec<EventKind>,
    /// Override of the authority's post-create delay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settle_delay_seconds: Option<u64>,
    /// Publish `<root>/secretName` and `<root>/secretArn` parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssm_root: Option<String>,
    pub authority: AuthorityConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthorityConfig {
    IcaV1 {
        #[serde(default = "default_ica_v1_url")]
        base_url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        #[serde(default)]
        project_ids: Vec<String>,
    },
    IcaV2 {
        #[serde(default = "default_ica_v2_url")]
        base_url: String,
    },
    Pieriandx {
        #[serde(default = "default_pieriandx_url")]
        base_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub repos: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_name: Option<String>,
}

/// Copy a secret into a downstream system on a schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub name: String,
    #[serde(default = "default_sync_target")]
    pub target: String,
    pub source_secret: String,
    pub token_secret: String,
    pub host_parameter: String,
    #[serde(default = "default_sync_scope")]
    pub scope: String,
    #[serde(default = "default_sync_key")]
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    #[serde(default = "default_sync_interval")]
    pub interval_hours: u64,
}

fn default_region() -> String {
    "ap-southeast-2".to_string()
}

fn default_invocation_timeout() -> u64 {
    60
}

fn default_jitter() -> bool {
    true
}

fn default_slack_host() -> String {
    "hooks.slack.com".to_string()
}

fn default_rotation_interval() -> u64 {
    48
}

fn default_notify_on() -> Vec<EventKind> {
    EventKind::all()
}

fn default_ica_v1_url() -> String {
    "https://aps2.platform.illumina.com".to_string()
}

fn default_ica_v2_url() -> String {
    "https://ica.illumina.com/ica/rest".to_string()
}

fn default_pieriandx_url() -> String {
    "https://app.pieriandx.com/cgw-api".to_string()
}

fn default_sync_target() -> String {
    "databricks".to_string()
}

fn default_sync_scope() -> String {
    "orcabus".to_string()
}

fn default_sync_key() -> String {
    "orcabus_jwt".to_string()
}

fn default_sync_interval() -> u64 {
    24
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            invocation_timeout_seconds: default_invocation_timeout(),
            jitter: default_jitter(),
        }
    }
}

impl SchedulerSettings {
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            invocation_timeout: Duration::from_secs(self.invocation_timeout_seconds),
            jitter: self.jitter,
        }
    }
}

impl AuthorityConfig {
    pub fn kind_name(&self) -> &'static str {
        match self {
            AuthorityConfig::IcaV1 { .. } => "ica_v1",
            AuthorityConfig::IcaV2 { .. } => "ica_v2",
            AuthorityConfig::Pieriandx { .. } => "pieriandx",
        }
    }

    /// ICA tokens carry an `nbf` claim that suffers from clock skew
    pub fn default_settle_delay(&self) -> Duration {
        match self {
            AuthorityConfig::IcaV1 { .. } | AuthorityConfig::IcaV2 { .. } => Duration::from_secs(30),
            AuthorityConfig::Pieriandx { .. } => Duration::ZERO,
        }
    }
}

impl IntegrationConfig {
    pub fn schedule(&self) -> crate::error::Result<Schedule> {
        match self.rotation_interval_hours {
            0 => Ok(Schedule::OnDemand),
            hours => Schedule::hours(hours),
        }
    }

    /// Events this integration's notifications care about
    pub fn filter(&self) -> EventFilter {
        EventFilter::new(&self.notify_on, [self.derived_secret.clone()])
    }

    pub fn settle_delay(&self) -> Duration {
        self.settle_delay_seconds
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.authority.default_settle_delay())
    }
}

impl SyncConfig {
    pub fn schedule(&self) -> crate::error::Result<Schedule> {
        match self.interval_hours {
            0 => Ok(Schedule::OnDemand),
            hours => Schedule::hours(hours),
        }
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&contents).context("Failed to parse config file")
    }

    /// Load a single-integration configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let account = AccountConfig {
            id: std::env::var("CREDROT_ACCOUNT_ID")
                .context("CREDROT_ACCOUNT_ID environment variable not set")?,
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| default_region()),
            aliases: BTreeMap::new(),
        };

        let kind = std::env::var("CREDROT_AUTHORITY").unwrap_or_else(|_| "ica_v2".to_string());
        let base_url = std::env::var("CREDROT_BASE_URL").ok();
        let authority = match kind.as_str() {
            "ica_v1" => AuthorityConfig::IcaV1 {
                base_url: base_url.unwrap_or_else(default_ica_v1_url),
                project_id: std::env::var("CREDROT_PROJECT_ID").ok(),
                project_ids: env_list("CREDROT_PROJECT_IDS"),
            },
            "ica_v2" => AuthorityConfig::IcaV2 {
                base_url: base_url.unwrap_or_else(default_ica_v2_url),
            },
            "pieriandx" => AuthorityConfig::Pieriandx {
                base_url: base_url.unwrap_or_else(default_pieriandx_url),
            },
            other => anyhow::bail!(
                "Unknown authority kind: {}. Supported: ica_v1, ica_v2, pieriandx",
                other
            ),
        };

        let integration = IntegrationConfig {
            name: std::env::var("CREDROT_NAME").unwrap_or_else(|_| kind.clone()),
            master_secret: std::env::var("CREDROT_MASTER_SECRET")
                .context("CREDROT_MASTER_SECRET environment variable not set")?,
            derived_secret: std::env::var("CREDROT_DERIVED_SECRET")
                .context("CREDROT_DERIVED_SECRET environment variable not set")?,
            rotation_interval_hours: std::env::var("CREDROT_ROTATION_INTERVAL_HOURS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_rotation_interval),
            rotator_role_arn: std::env::var("CREDROT_ROTATOR_ROLE_ARN").ok(),
            rotator_function_arn: std::env::var("CREDROT_ROTATOR_FUNCTION_ARN").ok(),
            collector_role_arn: std::env::var("CREDROT_COLLECTOR_ROLE_ARN").ok(),
            consumer_role_arns: env_list("CREDROT_CONSUMER_ROLE_ARNS"),
            notify_on: default_notify_on(),
            settle_delay_seconds: None,
            ssm_root: std::env::var("CREDROT_SSM_ROOT").ok(),
            authority,
            github: None,
        };

        let slack = std::env::var("SLACK_CHANNEL").ok().map(|channel| SlackConfig {
            host: std::env::var("SLACK_HOST").unwrap_or_else(|_| default_slack_host()),
            host_ssm_name: std::env::var("SLACK_HOST_SSM_NAME").ok(),
            webhook_id: None,
            webhook_ssm_name: std::env::var("SLACK_WEBHOOK_SSM_NAME").ok(),
            channel,
        });

        Ok(Self {
            account,
            scheduler: SchedulerSettings::default(),
            slack,
            integrations: vec![integration],
            syncs: Vec::new(),
        })
    }

    /// Look up an integration by name
    pub fn integration(&self, name: &str) -> Result<&IntegrationConfig> {
        self.integrations
            .iter()
            .find(|i| i.name == name)
            .with_context(|| {
                let known: Vec<&str> = self.integrations.iter().map(|i| i.name.as_str()).collect();
                format!("No integration named '{}' (configured: {})", name, known.join(", "))
            })
    }

    pub fn sync(&self, name: &str) -> Result<&SyncConfig> {
        self.syncs
            .iter()
            .find(|s| s.name == name)
            .with_context(|| format!("No sync job named '{}'", name))
    }

    fn sample() -> Self {
        let mut aliases = BTreeMap::new();
        aliases.insert("472057503814".to_string(), "prod".to_string());
        aliases.insert("843407916570".to_string(), "dev".to_string());

        Self {
            account: AccountConfig {
                id: "843407916570".to_string(),
                region: default_region(),
                aliases,
            },
            scheduler: SchedulerSettings::default(),
            slack: Some(SlackConfig {
                host: default_slack_host(),
                host_ssm_name: None,
                webhook_id: None,
                webhook_ssm_name: Some("/slack/webhook/id".to_string()),
                channel: "#biobots".to_string(),
            }),
            integrations: vec![
                IntegrationConfig {
                    name: "icav2".to_string(),
                    master_secret: "ICAv2ApiKey".to_string(),
                    derived_secret: "ICAv2Jwt".to_string(),
                    rotation_interval_hours: default_rotation_interval(),
                    rotator_role_arn: Some(
                        "arn:aws:iam::843407916570:role/icav2-jwt-producer".to_string(),
                    ),
                    rotator_function_arn: None,
                    collector_role_arn: None,
                    consumer_role_arns: vec![],
                    notify_on: default_notify_on(),
                    settle_delay_seconds: None,
                    ssm_root: None,
                    authority: AuthorityConfig::IcaV2 {
                        base_url: default_ica_v2_url(),
                    },
                    github: Some(GithubConfig {
                        repos: vec!["repo:umccr/infrastructure:*".to_string()],
                        role_name: Some("gh-icav2-jwt".to_string()),
                    }),
                },
                IntegrationConfig {
                    name: "pieriandx".to_string(),
                    master_secret: "PierianDx/UserPassword".to_string(),
                    derived_secret: "PierianDx/JwtKey".to_string(),
                    rotation_interval_hours: 12,
                    rotator_role_arn: Some(
                        "arn:aws:iam::843407916570:role/pieriandx-jwt-producer".to_string(),
                    ),
                    rotator_function_arn: None,
                    collector_role_arn: Some(
                        "arn:aws:iam::843407916570:role/pieriandx-jwt-collector".to_string(),
                    ),
                    consumer_role_arns: vec![],
                    notify_on: vec![EventKind::RotationFailed],
                    settle_delay_seconds: None,
                    ssm_root: Some("/pieriandx/jwt".to_string()),
                    authority: AuthorityConfig::Pieriandx {
                        base_url: default_pieriandx_url(),
                    },
                    github: None,
                },
            ],
            syncs: vec![],
        }
    }

    /// Create a sample configuration file
    pub fn create_sample<P: AsRef<Path>>(path: P) -> Result<()> {
        let toml_string =
            toml::to_string_pretty(&Self::sample()).context("Failed to serialize sample config")?;
        fs::write(path.as_ref(), toml_string)
            .with_context(|| format!("Failed to write sample config to {:?}", path.as_ref()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CONFIG: &str = r##"
[account]
id = "843407916570"

[account.aliases]
"472057503814" = "prod"

[slack]
webhook_id = "T000/B000/XXX"
channel = "#alerts"

[[integrations]]
name = "ica"
master_secret = "IcaSecretsPortalMaster"
derived_secret = "IcaSecretsPortal"
rotator_role_arn = "arn:aws:iam::843407916570:role/ica-jwt-producer"

[integrations.authority]
kind = "ica_v1"
project_ids = ["p1", "p2"]

[[integrations]]
name = "icav2"
master_secret = "ICAv2ApiKey"
derived_secret = "ICAv2Jwt"
rotation_interval_hours = 0
notify_on = ["RotationFailed"]

[integrations.authority]
kind = "ica_v2"
base_url = "https://ica.example.com/ica/rest"

[integrations.github]
repos = ["repo:umccr/infrastructure:*"]
role_name = "gh-icav2-jwt"
"##;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_from_file() {
        let file = write_config(CONFIG);
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.account.region, "ap-southeast-2");
        assert_eq!(config.account.aliases["472057503814"], "prod");
        assert_eq!(config.scheduler.invocation_timeout_seconds, 60);
        assert!(config.scheduler.jitter);
        assert_eq!(config.slack.as_ref().unwrap().host, "hooks.slack.com");

        let ica = config.integration("ica").unwrap();
        assert_eq!(ica.rotation_interval_hours, 48);
        assert_eq!(ica.notify_on, EventKind::all());
        assert_eq!(
            ica.authority,
            AuthorityConfig::IcaV1 {
                base_url: "https://aps2.platform.illumina.com".to_string(),
                project_id: None,
                project_ids: vec!["p1".to_string(), "p2".to_string()],
            }
        );
        assert_eq!(ica.settle_delay(), Duration::from_secs(30));

        let icav2 = config.integration("icav2").unwrap();
        assert_eq!(icav2.schedule().unwrap(), Schedule::OnDemand);
        assert_eq!(icav2.notify_on, vec![EventKind::RotationFailed]);
        assert_eq!(icav2.github.as_ref().unwrap().role_name.as_deref(), Some("gh-icav2-jwt"));
    }

    #[test]
    fn test_unknown_integration() {
        let file = write_config(CONFIG);
        let config = Config::from_file(file.path()).unwrap();
        let err = config.integration("databricks").unwrap_err();
        assert!(err.to_string().contains("ica, icav2"));
    }

    #[test]
    fn test_unknown_authority_kind_is_rejected() {
        let file = write_config(&CONFIG.replace("kind = \"ica_v2\"", "kind = \"okta\""));
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::from_file("/nonexistent/credrot.toml").is_err());
    }

    #[test]
    fn test_sample_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credrot.toml");
        Config::create_sample(&path).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.integrations.len(), 2);
        let pdx = config.integration("pieriandx").unwrap();
        assert_eq!(pdx.schedule().unwrap(), Schedule::hours(12).unwrap());
        assert_eq!(pdx.settle_delay(), Duration::ZERO);
        assert_eq!(pdx.authority.kind_name(), "pieriandx");
    }

    #[test]
    fn test_overflowing_interval_is_rejected() {
        let file = write_config(CONFIG);
        let config = Config::from_file(file.path()).unwrap();
        let mut ica = config.integration("ica").unwrap().clone();
        ica.rotation_interval_hours = u64::MAX;
        let err = ica.schedule().unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Config);
    }

    #[test]
    fn test_integration_filter_watches_derived_secret() {
        let file = write_config(CONFIG);
        let config = Config::from_file(file.path()).unwrap();
        let icav2 = config.integration("icav2").unwrap();
        let filter = icav2.filter();
        let failure = crate::error::RotationError::Transient("timeout".to_string());

        let watched = crate::events::RotationEvent::failed(icav2.derived_secret.as_str(), &failure);
        assert!(filter.matches(&watched));
        assert!(!filter.matches(&crate::events::RotationEvent::failed("Other", &failure)));
    }

    #[test]
    fn test_scheduler_settings() {
        let settings = SchedulerSettings {
            invocation_timeout_seconds: 90,
            jitter: false,
        };
        let config = settings.to_scheduler_config();
        assert_eq!(config.invocation_timeout, Duration::from_secs(90));
        assert!(!config.jitter);
    }
}
