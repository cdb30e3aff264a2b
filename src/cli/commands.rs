//! Command implementations for the CLI
//!
//! SBIO pattern: Commands return Results, I/O is handled by caller

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::{DeleteArgs, DeployArgs, PlanArgs, UserArgs};
use crate::balancing::{Distribution, LoadBalancer, RoundRobinBalancer, WeightedBalancer};
use crate::config::{
    load_stand_file, load_users_file, parse_user_list, validate_users, ConfigError, Settings,
    StandConfig, ValidationReport,
};
use crate::deploy::{DeploymentCoordinator, DeploymentResult, Strategy};
use crate::error::StandError;
use crate::gateway::{ClusterGateway, GatewayError, ProxmoxGateway, VmidAllocator};
use crate::lifecycle::{DeletionReport, ResourceLifecycleManager};
use crate::templates::{
    RedbTemplateStore, StoreError, TemplateManager, TemplateMapping, TemplateRecord, TemplateStore,
};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Stand(#[from] StandError),

    #[error("Cluster error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Template store error: {0}")]
    Store(#[from] StoreError),

    #[error("Usage error: {0}")]
    Usage(String),
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

/// Everything a cluster-facing command needs, wired once per invocation
pub struct Session {
    pub settings: Settings,
    pub gateway: Arc<dyn ClusterGateway>,
    pub templates: Arc<TemplateManager>,
    pub lifecycle: Arc<ResourceLifecycleManager>,
}

impl Session {
    /// Connect to the configured cluster and open the template cache
    pub fn connect(settings: Settings) -> CommandResult<Self> {
        let gateway: Arc<dyn ClusterGateway> = Arc::new(ProxmoxGateway::new(&settings.connection)?);
        let store = Arc::new(RedbTemplateStore::open(&settings.template_cache_path())?);
        info!("Connected to {}", settings.connection.base_url());
        Ok(Self::new(settings, gateway, store))
    }

    pub fn new(
        settings: Settings,
        gateway: Arc<dyn ClusterGateway>,
        store: Arc<dyn TemplateStore>,
    ) -> Self {
        let vmids = Arc::new(VmidAllocator::new());
        let templates = Arc::new(
            TemplateManager::new(gateway.clone(), store)
                .with_task_policy(settings.timeouts.task_policy())
                .with_vmid_allocator(vmids.clone()),
        );
        let lifecycle = Arc::new(
            ResourceLifecycleManager::from_settings(gateway.clone(), &settings)
                .with_vmid_allocator(vmids),
        );
        Self {
            settings,
            gateway,
            templates,
            lifecycle,
        }
    }

    pub fn coordinator(&self) -> DeploymentCoordinator {
        DeploymentCoordinator::new(
            self.gateway.clone(),
            self.templates.clone(),
            self.lifecycle.clone(),
        )
        .with_bridge_policy(self.settings.bridges.clone())
    }
}

// ============================================================================
// Input loading (no cluster access)
// ============================================================================

/// Users from `--users` or `--users-file`
pub fn resolve_users(args: &UserArgs) -> CommandResult<Vec<String>> {
    match (&args.users, &args.users_file) {
        (Some(list), _) => Ok(parse_user_list(list)),
        (None, Some(path)) => Ok(load_users_file(path)?),
        (None, None) => Err(CommandError::Usage(
            "either --users or --users-file is required".to_string(),
        )),
    }
}

/// Load a stand file and reject it when validation finds errors
pub fn load_valid_stand(path: &Path) -> CommandResult<StandConfig> {
    let config = load_stand_file(path)?;
    let report = config.validate();
    if report.has_errors() {
        return Err(StandError::Validation(report.error_summary()).into());
    }
    Ok(config)
}

/// Validate a stand file without touching the cluster
pub fn validate_command(path: &Path) -> CommandResult<ValidationReport> {
    Ok(load_stand_file(path)?.validate())
}

// ============================================================================
// Cluster commands
// ============================================================================

pub async fn deploy_command(session: &Session, args: &DeployArgs) -> CommandResult<DeploymentResult> {
    let config = load_valid_stand(&args.file)?;
    let users = resolve_users(&args.users)?;
    let strategy = Strategy::from_name(args.strategy.as_str(), args.target_node.as_deref())?;
    Ok(session.coordinator().deploy(&strategy, &users, &config).await?)
}

pub async fn delete_command(session: &Session, args: &DeleteArgs) -> CommandResult<DeletionReport> {
    let (users, report) = validate_users(&resolve_users(&args.users)?);
    if report.has_errors() {
        return Err(StandError::Validation(report.error_summary()).into());
    }
    Ok(session.lifecycle.delete_stands(&users).await)
}

/// Node assignment a deployment would use; creates nothing
pub async fn plan_command(session: &Session, args: &PlanArgs) -> CommandResult<Distribution> {
    let config = load_valid_stand(&args.file)?;
    let (users, report) = validate_users(&resolve_users(&args.users)?);
    if report.has_errors() {
        return Err(StandError::Validation(report.error_summary()).into());
    }

    let nodes = session.gateway.get_nodes().await?;
    let balancer: Box<dyn LoadBalancer> = if args.weighted {
        Box::new(WeightedBalancer::new(session.gateway.clone()))
    } else {
        Box::new(RoundRobinBalancer::new())
    };
    let machines = config.machines.len();
    let mut distribution = balancer.distribute(&users, &nodes, machines).await?;
    if args.optimize {
        distribution = balancer.optimize_distribution(&distribution, machines).await?;
    }
    Ok(distribution)
}

pub fn templates_list(session: &Session) -> CommandResult<Vec<TemplateRecord>> {
    Ok(session.templates.records()?)
}

pub async fn templates_forget(session: &Session, vmid: u32, node: &str) -> CommandResult<bool> {
    Ok(session.templates.forget(vmid, node).await?)
}

pub async fn templates_prepare(
    session: &Session,
    path: &Path,
    node: &str,
) -> CommandResult<TemplateMapping> {
    let config = load_valid_stand(path)?;
    Ok(session.templates.prepare(&config, node).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    use crate::cli::StrategyArg;
    use crate::gateway::InMemoryCluster;
    use crate::templates::MemoryTemplateStore;

    fn stand_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            br#"
machines:
  - template_vmid: 100
    template_node: pve1
    networks:
      - bridge: hq
"#,
        )
        .unwrap();
        file
    }

    fn session(cluster: Arc<InMemoryCluster>) -> Session {
        let mut settings = Settings::default();
        settings.timeouts.task_poll_interval_ms = 5;
        settings.timeouts.verify_delay_secs = 0;
        settings.timeouts.verify_retry_delay_secs = 0;
        Session::new(settings, cluster, Arc::new(MemoryTemplateStore::new()))
    }

    fn users(list: &str) -> UserArgs {
        UserArgs {
            users: Some(list.to_string()),
            users_file: None,
        }
    }

    #[test]
    fn test_resolve_users_requires_a_source() {
        assert!(matches!(
            resolve_users(&UserArgs::default()),
            Err(CommandError::Usage(_))
        ));
        assert_eq!(resolve_users(&users("a, b")).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_validate_command() {
        let file = stand_file();
        let report = validate_command(file.path()).unwrap();
        assert!(!report.has_errors());
    }

    #[tokio::test]
    async fn test_deploy_then_delete() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]).with_template("pve1", 100));
        let session = session(cluster.clone());
        let file = stand_file();

        let deploy = DeployArgs {
            file: file.path().to_path_buf(),
            users: users("alice,bob"),
            strategy: StrategyArg::Local,
            target_node: None,
        };
        let result = deploy_command(&session, &deploy).await.unwrap();
        assert!(result.is_success());
        assert_eq!(cluster.guests_on("pve1").len(), 2);

        let report = delete_command(&session, &DeleteArgs { users: users("alice,bob") })
            .await
            .unwrap();
        assert_eq!(report.deleted_count(), 2);
        assert!(cluster.guests_on("pve1").is_empty());
    }

    #[tokio::test]
    async fn test_plan_creates_nothing() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1", "pve2"]).with_template("pve1", 100));
        let session = session(cluster.clone());
        let file = stand_file();

        let args = PlanArgs {
            file: file.path().to_path_buf(),
            users: users("a,b,c"),
            weighted: true,
            optimize: true,
        };
        let distribution = plan_command(&session, &args).await.unwrap();
        assert_eq!(distribution.values().map(Vec::len).sum::<usize>(), 3);
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_without_target_is_rejected() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]).with_template("pve1", 100));
        let session = session(cluster);
        let file = stand_file();
        let deploy = DeployArgs {
            file: PathBuf::from(file.path()),
            users: users("alice"),
            strategy: StrategyArg::Remote,
            target_node: None,
        };
        assert!(matches!(
            deploy_command(&session, &deploy).await,
            Err(CommandError::Stand(StandError::Validation(_)))
        ));
    }
}
