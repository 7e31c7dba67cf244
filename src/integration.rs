//! One master/derived secret pair wired end to end.
//!
//! An [`IntegrationConfig`] goes in; the secrets, their resource policies,
//! the rotation binding, the optional federated grant and the published
//! parameters come out. All configuration errors surface from
//! [`Integration::build`] before anything is created.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::authority::{self, Authority};
use crate::backends::{ParameterStore, RotationBinding, SecretHandle, Store};
use crate::collector::Collector;
use crate::config::{AccountConfig, IntegrationConfig};
use crate::error::{Result, RotationError};
use crate::events::EventFilter;
use crate::federation::{github_actions_grant, FederatedGrant};
use crate::identity::{Identity, IdentityRef};
use crate::policy::{
    allow_actions, allow_read, deny_all_except, PolicyHazard, RestrictionPolicy, Statement,
    ROTATE_SECRET,
};
use crate::rotation::Rotator;
use crate::scheduler::Schedule;

/// Resource policies for both secrets plus the federated grant, if any
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyPlan {
    pub master: RestrictionPolicy,
    pub derived: RestrictionPolicy,
    pub federated: Option<FederatedGrant>,
    /// Identity-side grants every reader needs alongside the resource policies
    #[serde(skip)]
    pub grants: Vec<(Identity, Statement)>,
}

impl PolicyPlan {
    pub fn hazards(&self) -> impl Iterator<Item = &PolicyHazard> {
        self.master.hazards.iter().chain(self.derived.hazards.iter())
    }
}

/// What `provision` created or found
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProvisionedIntegration {
    pub name: String,
    pub master: SecretHandle,
    pub derived: SecretHandle,
    pub plan: PolicyPlan,
    /// SSM parameters written, if publication is configured
    pub published: Vec<String>,
}

pub struct Integration {
    config: IntegrationConfig,
    account_id: String,
    region: String,
    store: Store,
    params: Option<Arc<dyn ParameterStore>>,
    rotator_identity: Identity,
    collector_identity: Option<Identity>,
    consumers: Vec<Identity>,
    authority: Authority,
    schedule: Schedule,
}

impl Integration {
    /// Validate `config` and resolve every identity it names
    pub fn build(
        store: Store,
        params: Option<Arc<dyn ParameterStore>>,
        account: &AccountConfig,
        config: &IntegrationConfig,
    ) -> Result<Self> {
        if config.master_secret.trim().is_empty() || config.derived_secret.trim().is_empty() {
            return Err(RotationError::config(format!(
                "integration {} needs both a master and a derived secret name",
                config.name
            )));
        }
        if config.master_secret == config.derived_secret {
            return Err(RotationError::config(format!(
                "integration {} uses {} as both master and derived secret",
                config.name, config.master_secret
            )));
        }
        if config.ssm_root.is_some() && params.is_none() {
            return Err(RotationError::config(format!(
                "integration {} publishes to SSM but no parameter store is available",
                config.name
            )));
        }

        let rotator_identity =
            IdentityRef::new(rotator_name(&config.name), config.rotator_role_arn.clone()).resolve()?;
        let collector_identity = config
            .collector_role_arn
            .as_ref()
            .map(|arn| {
                IdentityRef::new(format!("{}-collector", config.name), Some(arn.clone())).resolve()
            })
            .transpose()?;
        let consumers = config
            .consumer_role_arns
            .iter()
            .map(|arn| IdentityRef::new(format!("{}-consumer", config.name), Some(arn.clone())).resolve())
            .collect::<Result<Vec<_>>>()?;
        let authority = authority::from_config(&config.authority)?;
        let schedule = config.schedule()?;

        let integration = Self {
            config: config.clone(),
            account_id: account.id.clone(),
            region: account.region.clone(),
            store,
            params,
            rotator_identity,
            collector_identity,
            consumers,
            authority,
            schedule,
        };

        // federation problems are config errors too; surface them now
        let (master, derived) = integration.planned_handles();
        integration.plan(&master, &derived)?;

        debug!(
            "Built integration {} ({} via {})",
            config.name,
            config.derived_secret,
            integration.authority.authority_type()
        );
        Ok(integration)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn rotator_identity(&self) -> &Identity {
        &self.rotator_identity
    }

    /// Handles with ARN patterns, for planning before the secrets exist
    pub fn planned_handles(&self) -> (SecretHandle, SecretHandle) {
        (
            SecretHandle::planned(&self.region, &self.account_id, &self.config.master_secret),
            SecretHandle::planned(&self.region, &self.account_id, &self.config.derived_secret),
        )
    }

    /// Everyone allowed to read the derived secret
    fn derived_readers(&self, federated: Option<&FederatedGrant>) -> Vec<IdentityRef> {
        let mut readers = vec![IdentityRef::from(&self.rotator_identity)];
        readers.extend(self.collector_identity.iter().map(IdentityRef::from));
        readers.extend(self.consumers.iter().map(IdentityRef::from));
        if let Some(grant) = federated {
            readers.push(IdentityRef::from(&grant.identity()));
        }
        readers
    }

    pub fn plan(&self, master: &SecretHandle, derived: &SecretHandle) -> Result<PolicyPlan> {
        let github = self.config.github.as_ref();
        let federated = github_actions_grant(
            &self.account_id,
            derived,
            github.map(|g| g.repos.as_slice()).unwrap_or_default(),
            github.and_then(|g| g.role_name.as_deref()),
        )?;

        let master_policy = deny_all_except(
            &master.name,
            &self.account_id,
            &[IdentityRef::from(&self.rotator_identity)],
        )?;
        let derived_policy = deny_all_except(
            &derived.name,
            &self.account_id,
            &self.derived_readers(federated.as_ref()),
        )?;

        let mut grants = vec![
            (self.rotator_identity.clone(), allow_read(&master.arn)),
            (self.rotator_identity.clone(), allow_read(&derived.arn)),
        ];
        for reader in self.collector_identity.iter().chain(self.consumers.iter()) {
            grants.push((reader.clone(), allow_read(&derived.arn)));
        }
        if let Some(collector) = &self.collector_identity {
            grants.push((collector.clone(), collector_rotate_grant(derived)));
        }
        if let Some(grant) = &federated {
            for statement in &grant.permission_policy.statement {
                grants.push((grant.identity(), statement.clone()));
            }
        }

        Ok(PolicyPlan {
            master: master_policy,
            derived: derived_policy,
            federated,
            grants,
        })
    }

    async fn ensure_secret(&self, name: &str, description: &str) -> Result<SecretHandle> {
        match self.store.describe(name).await {
            Ok(existing) => {
                debug!("Secret {} already exists", name);
                Ok(existing.handle())
            }
            Err(RotationError::NotFound(_)) => self.store.create(name, description, None).await,
            Err(e) => Err(e),
        }
    }

    /// Create or reuse both secrets, attach their policies and bind the rotator
    pub async fn provision(&self) -> Result<ProvisionedIntegration> {
        let authority_type = self.authority.authority_type();
        let master = self
            .ensure_secret(
                &self.config.master_secret,
                &format!("Master credential for {}", authority_type),
            )
            .await?;
        let derived = self
            .ensure_secret(
                &self.config.derived_secret,
                &format!("{} credential derived from {}", authority_type, master.name),
            )
            .await?;

        let plan = self.plan(&master, &derived)?;
        self.store.attach_policy(&master.arn, &plan.master.document).await?;
        self.store.attach_policy(&derived.arn, &plan.derived.document).await?;

        self.store
            .bind_rotation(
                &derived.arn,
                RotationBinding {
                    rotator: self.rotator_identity.clone(),
                    function_arn: self.config.rotator_function_arn.clone(),
                    schedule: self.schedule(),
                },
            )
            .await?;

        let mut published = Vec::new();
        if let (Some(root), Some(params)) = (&self.config.ssm_root, &self.params) {
            let root = root.trim_end_matches('/');
            for (key, value) in [("secretName", &derived.name), ("secretArn", &derived.arn)] {
                let name = format!("{}/{}", root, key);
                params.put(&name, value).await?;
                published.push(name);
            }
        }

        info!(
            "Provisioned integration {}: {} -> {}",
            self.config.name, master.name, derived.name
        );
        Ok(ProvisionedIntegration {
            name: self.config.name.clone(),
            master,
            derived,
            plan,
            published,
        })
    }

    pub fn rotator(&self) -> Rotator {
        Rotator::new(
            rotator_name(&self.config.name),
            self.rotator_identity.clone(),
            self.store.clone(),
            self.config.master_secret.clone(),
            self.config.derived_secret.clone(),
            self.authority.clone(),
        )
        .with_settle_delay(self.config.settle_delay())
        .with_account(self.account_id.clone())
    }

    /// A collector, when the integration has a collector role
    pub fn collector(&self) -> Option<Collector> {
        let identity = self.collector_identity.clone()?;
        let (_, derived) = self.planned_handles();
        Some(
            Collector::new(identity, self.store.clone(), Arc::new(self.rotator()))
                .with_grants(vec![collector_rotate_grant(&derived)]),
        )
    }

    /// Events this integration's notifications care about
    pub fn filter(&self) -> EventFilter {
        self.config.filter()
    }
}

/// The collector may start a rotation of the derived secret, nothing else
fn collector_rotate_grant(derived: &SecretHandle) -> Statement {
    allow_actions(&[ROTATE_SECRET], &derived.arn)
}

fn rotator_name(integration: &str) -> String {
    format!("{}-rotator", integration)
}
