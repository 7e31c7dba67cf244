//! CLI parsing and command execution
//!
//! This module handles command-line argument parsing and routes commands to the appropriate handlers.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{
    self, AwsSecretsStore, MemoryParameterStore, MemoryStore, ParameterStore, SecretStore,
    SecretValue, SsmParameterStore, Store, StoreType,
};
use crate::collector::Collected;
use crate::config::{Config, SyncConfig};
use crate::events::{EventBus, EventFilter, RotationEvent};
use crate::identity::IdentityRef;
use crate::integration::{Integration, ProvisionedIntegration};
use crate::notify::{LogNotifier, Notifier, SlackNotifier};
use crate::rotation::{RotationStep, StepOutcome, StepRequest};
use crate::scheduler::{Invocable, Payload, Scheduler};
use crate::targets::{SyncJob, TargetType};

#[derive(Parser)]
#[command(name = "credrot")]
#[command(about = "Master/derived credential rotation with deny-by-default secret access policies", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "CREDROT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Secret store to use (memory or aws)
    #[arg(long, env = "CREDROT_STORE", default_value = "aws")]
    pub store: String,

    /// AWS region (overrides config file)
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// Master value to seed into the in-memory store
    #[arg(long, env = "CREDROT_MASTER_VALUE", hide_env_values = true)]
    pub master_value: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a sample configuration file
    Init {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "credrot.toml")]
        output: PathBuf,
    },

    /// Print the resource policies and federated grant of an integration
    Policy {
        /// Integration name
        integration: String,
    },

    /// Create or update the secrets, policies and rotation binding of an integration
    Provision {
        /// Integration name
        integration: String,
    },

    /// Rotate the derived secret of an integration now
    Rotate {
        /// Integration name
        integration: String,
    },

    /// Run one step of a store-driven rotation
    Step {
        /// Integration name
        integration: String,

        /// Secret name or ARN
        #[arg(long)]
        secret_id: String,

        /// Client request token (version id)
        #[arg(long)]
        token: String,

        /// createSecret, setSecret, testSecret or finishSecret
        #[arg(long)]
        step: RotationStep,
    },

    /// Print a valid derived token, rotating first if needed
    Collect {
        /// Integration name
        integration: String,
    },

    /// Schedule every integration and sync job until interrupted
    Run {
        /// Provision every integration before scheduling it
        #[arg(long)]
        provision: bool,
    },

    /// Run a configured secret sync once
    Sync {
        /// Sync job name
        name: String,
    },

    /// Forward a CloudTrail-shaped rotation event to the notifier
    Notify {
        /// Path to the event JSON
        #[arg(short, long)]
        event: PathBuf,
    },

    /// Print the identity the AWS credentials resolve to
    Whoami,
}

/// Store plus everything built alongside it
struct Runtime {
    config: Config,
    store: Store,
    params: Arc<dyn ParameterStore>,
    /// Set when running against the in-memory store, which needs identity
    /// grants and a master value applied locally
    memory: Option<Arc<MemoryStore>>,
    master_value: Option<SecretValue>,
}

/// Execute a CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    // Handle init command separately as it doesn't need a store
    if let Commands::Init { output } = cli.command {
        Config::create_sample(&output)
            .with_context(|| format!("Failed to create sample config at {:?}", output))?;
        info!("Sample configuration created at {:?}", output);
        return Ok(());
    }

    if let Commands::Whoami = cli.command {
        let sdk = backends::load_sdk_config(cli.region.clone()).await;
        let identity = backends::caller_identity(&sdk)
            .await
            .context("Failed to resolve caller identity")?;
        println!("{}", identity);
        return Ok(());
    }

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        Config::from_env().context("Failed to load config from environment")?
    };

    // Override with CLI arguments if provided
    if let Some(region) = &cli.region {
        config.account.region = region.clone();
    }

    let store_type: StoreType = cli.store.parse().map_err(anyhow::Error::msg)?;

    let runtime = create_runtime(config, store_type, cli.master_value).await?;

    // Execute command
    match cli.command {
        Commands::Init { .. } | Commands::Whoami => unreachable!(), // Handled above
        Commands::Policy { integration } => {
            let integration = runtime.integration(&integration)?;
            let (master, derived) = integration.planned_handles();
            let plan = integration
                .plan(&master, &derived)
                .context("Failed to compute policies")?;

            println!("Master secret {} resource policy:", master.name);
            println!("{}", plan.master.document.to_json_pretty()?);
            println!("\nDerived secret {} resource policy:", derived.name);
            println!("{}", plan.derived.document.to_json_pretty()?);
            if let Some(grant) = &plan.federated {
                println!("\nFederated role {} trust policy:", grant.role_arn);
                println!("{}", grant.trust_policy.to_json_pretty()?);
                println!("\nFederated role {} permissions:", grant.role_arn);
                println!("{}", grant.permission_policy.to_json_pretty()?);
            }
            for hazard in plan.hazards() {
                eprintln!("⚠️  {}", hazard);
            }
        }
        Commands::Provision { integration } => {
            let integration = runtime.integration(&integration)?;
            let provisioned = runtime.provision(&integration).await?;
            println!("✓ Provisioned {}", provisioned.name);
            println!("  Master:  {}", provisioned.master.arn);
            println!("  Derived: {}", provisioned.derived.arn);
            if let Some(grant) = &provisioned.plan.federated {
                println!("  Federated role: {}", grant.role_arn);
            }
            for name in &provisioned.published {
                println!("  Published: {}", name);
            }
        }
        Commands::Rotate { integration } => {
            let integration = runtime.integration(&integration)?;
            runtime.prepare(&integration).await?;
            let event = integration.rotator().rotate().await;
            report(&event)?;
        }
        Commands::Step {
            integration,
            secret_id,
            token,
            step,
        } => {
            let integration = runtime.integration(&integration)?;
            let request = StepRequest {
                secret_id,
                client_request_token: token,
                step,
            };
            let outcome = integration
                .rotator()
                .handle_step(&request)
                .await
                .with_context(|| format!("Step {} failed", request.step))?;
            match outcome {
                StepOutcome::AlreadyCurrent => {
                    println!("Version {} of {} is already current", request.client_request_token, request.secret_id)
                }
                StepOutcome::Completed => println!("✓ Finished step {} of {}", request.step, request.secret_id),
                StepOutcome::Promoted => println!("✓ Promoted {} of {}", request.client_request_token, request.secret_id),
            }
        }
        Commands::Collect { integration } => {
            let integration = runtime.integration(&integration)?;
            runtime.prepare(&integration).await?;
            let collector = integration
                .collector()
                .with_context(|| format!("Integration {} has no collector_role_arn", integration.name()))?;

            match collector.collect().await.context("Failed to collect token")? {
                Collected::Token(token) => {
                    eprintln!("⚠️  WARNING: Secret value will be displayed. Ensure this output is secured.");
                    println!("{}", token.expose());
                }
                Collected::RotationTriggered(event) => {
                    report(&event)?;
                    println!("Token was missing or expiring; collect again for the new one");
                }
            }
        }
        Commands::Run { provision } => run(&runtime, provision).await?,
        Commands::Sync { name } => {
            let sync = runtime.config.sync(&name)?;
            let job = runtime.sync_job(sync)?;
            job.run(&sync_payload(sync))
                .await
                .with_context(|| format!("Sync {} failed", sync.name))?;
            println!("✓ Synced {}", sync.name);
        }
        Commands::Notify { event } => {
            let contents = std::fs::read_to_string(&event)
                .with_context(|| format!("Failed to read event file {:?}", event))?;
            let raw: serde_json::Value =
                serde_json::from_str(&contents).context("Failed to parse event JSON")?;

            match RotationEvent::from_cloudtrail(&raw)? {
                Some(event) => {
                    let filters: Vec<EventFilter> =
                        runtime.config.integrations.iter().map(|i| i.filter()).collect();
                    let notifier = runtime.notifier().await?;
                    if forward(&filters, notifier.as_ref(), &event).await? {
                        println!("✓ Sent {} for {} to {}", event.kind(), event.secret_id, notifier.channel_name());
                    } else {
                        println!("No integration watches {} for {}, nothing to send", event.kind(), event.secret_id);
                    }
                }
                None => println!("Not a rotation event, nothing to send"),
            }
        }
    }

    Ok(())
}

async fn create_runtime(
    config: Config,
    store_type: StoreType,
    master_value: Option<String>,
) -> Result<Runtime> {
    let master_value = master_value.map(SecretValue::from);
    match store_type {
        StoreType::Aws => {
            if master_value.is_some() {
                warn!("--master-value is ignored with the aws store");
            }
            let sdk = backends::load_sdk_config(Some(config.account.region.clone())).await;
            let store: Store = Arc::new(AwsSecretsStore::new(&sdk));
            Ok(Runtime {
                config,
                store,
                params: Arc::new(SsmParameterStore::new(&sdk)),
                memory: None,
                master_value: None,
            })
        }
        StoreType::Memory => {
            let memory = Arc::new(MemoryStore::new(&config.account.id, &config.account.region));
            Ok(Runtime {
                config,
                store: memory.clone(),
                params: Arc::new(MemoryParameterStore::new()),
                memory: Some(memory),
                master_value,
            })
        }
    }
}

impl Runtime {
    fn integration(&self, name: &str) -> Result<Integration> {
        let config = self.config.integration(name)?;
        Integration::build(
            self.store.clone(),
            Some(self.params.clone()),
            &self.config.account,
            config,
        )
        .with_context(|| format!("Invalid configuration for integration {}", name))
    }

    async fn provision(&self, integration: &Integration) -> Result<ProvisionedIntegration> {
        let provisioned = integration
            .provision()
            .await
            .with_context(|| format!("Failed to provision {}", integration.name()))?;

        if let Some(memory) = &self.memory {
            for (identity, statement) in &provisioned.plan.grants {
                memory.grant(identity, statement.clone()).await;
            }
            if let Some(value) = &self.master_value {
                memory.write(&provisioned.master.arn, value.clone()).await?;
            }
        }
        Ok(provisioned)
    }

    /// The in-memory store starts empty every run
    async fn prepare(&self, integration: &Integration) -> Result<()> {
        if self.memory.is_some() {
            self.provision(integration).await?;
        }
        Ok(())
    }

    async fn notifier(&self) -> Result<Arc<dyn Notifier>> {
        match &self.config.slack {
            Some(slack) => {
                let notifier =
                    SlackNotifier::from_config(slack, self.config.account.aliases.clone(), self.params.as_ref())
                        .await
                        .context("Failed to configure Slack notifications")?;
                Ok(Arc::new(notifier))
            }
            None => {
                info!("No [slack] section configured, events are only logged");
                Ok(Arc::new(LogNotifier))
            }
        }
    }

    fn sync_job(&self, sync: &SyncConfig) -> Result<SyncJob> {
        let target_type: TargetType = sync.target.parse().map_err(anyhow::Error::msg)?;
        let identity = IdentityRef::new(&sync.name, sync.role_arn.clone()).resolve()?;
        Ok(SyncJob::new(
            &sync.name,
            identity,
            self.store.clone(),
            self.params.clone(),
            target_type,
            &sync.scope,
            &sync.key,
        ))
    }
}

fn sync_payload(sync: &SyncConfig) -> Payload {
    SyncJob::payload(&sync.source_secret, &sync.token_secret, &sync.host_parameter)
}

fn report(event: &RotationEvent) -> Result<()> {
    if event.is_success() {
        println!("✓ {} for {}", event.kind(), event.secret_id);
        Ok(())
    } else {
        anyhow::bail!(
            "{} for {}: {}",
            event.kind(),
            event.secret_id,
            event.error.as_deref().unwrap_or("no error message")
        )
    }
}

/// Deliver `event` if any filter watches it; returns whether it was sent
async fn forward(filters: &[EventFilter], notifier: &dyn Notifier, event: &RotationEvent) -> Result<bool> {
    if !filters.iter().any(|filter| filter.matches(event)) {
        return Ok(false);
    }
    notifier
        .notify(event)
        .await
        .with_context(|| format!("Failed to notify via {}", notifier.channel_name()))?;
    Ok(true)
}

async fn run(runtime: &Runtime, provision: bool) -> Result<()> {
    let bus = EventBus::new();
    let scheduler = Scheduler::new(runtime.config.scheduler.to_scheduler_config(), bus.clone());
    let notifier = runtime.notifier().await?;

    let mut subscriptions = Vec::new();
    for config in &runtime.config.integrations {
        let integration = runtime.integration(&config.name)?;
        if provision || runtime.memory.is_some() {
            runtime.provision(&integration).await?;
        }

        // a secret that already has a value waits one interval before its first rotation
        let description = runtime
            .store
            .describe(&config.derived_secret)
            .await
            .with_context(|| format!("Failed to describe {}", config.derived_secret))?;
        let last_attempt = description.current_version().map(|_| Utc::now());

        subscriptions.push(bus.subscribe(integration.filter(), notifier.clone()));
        let rotator: Arc<dyn Invocable> = Arc::new(integration.rotator());
        scheduler
            .schedule(integration.schedule(), rotator, Payload::new(), last_attempt)
            .await?;
    }

    for sync in &runtime.config.syncs {
        let job: Arc<dyn Invocable> = Arc::new(runtime.sync_job(sync)?);
        scheduler
            .schedule(sync.schedule()?, job, sync_payload(sync), None)
            .await?;
    }

    println!(
        "Scheduled {} integration(s) and {} sync job(s); press Ctrl-C to stop",
        runtime.config.integrations.len(),
        runtime.config.syncs.len()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    scheduler.shutdown().await;
    for subscription in subscriptions {
        subscription.abort();
    }
    Ok(())
}
