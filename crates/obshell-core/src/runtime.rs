// Copyright (C) 2025 OceanBase
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent assembly and background workers.
//!
//! [`AgentContext`] holds everything request handlers and workers share.
//! [`BackgroundWorkers`] runs the executor pool, coordinator, scheduler and
//! synchroniser until shut down.

use std::sync::Arc;

use obshell_security::SessionManager;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::agent::{AgentIdentity, AgentState};
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::credential::CredentialService;
use crate::error::Result;
use crate::keyring::Keyring;
use crate::membership::Membership;
use crate::observer_config::ObserverConfig;
use crate::package::PackageService;
use crate::persistence::{LocalStore, MySqlPersistence, SqlitePersistence, Stores};
use crate::remote::executable::REMOTE_SUB_DAG;
use crate::remote::join::{BE_FOLLOWER, BeFollower, JOIN_TO_MASTER, JoinToMaster, join_flags};
use crate::remote::rendezvous::{
    CHECK_DAG_STAGE, CREATE_SUB_DAGS, CheckDagStage, CreateSubDags, PASS_SUB_DAGS, PassSubDags,
    WAIT_SUB_DAG_FINISH, WaitSubDagFinish, rendezvous_flags,
};
use crate::remote::{RemoteSubDag, RpcClient};
use crate::synchronizer::{Synchronizer, SynchronizerConfig};
use crate::task::{
    EngineDeps, ExecutorConfig, ExecutorPool, Scheduler, SchedulerConfig, TaskFlags, TaskRegistry,
    TaskService,
};

/// Environment variable carrying the one-shot root password.
pub const ROOT_PASSWORD_ENV: &str = "OB_ROOT_PASSWORD";

const SCHEDULER_SUBSCRIPTION: &str = "scheduler";

/// Shared state of a running agent. Cheap to clone.
#[derive(Clone, Debug)]
pub struct AgentContext {
    /// Loaded configuration.
    pub config: Config,
    /// Local and cluster stores.
    pub stores: Stores,
    /// This agent's identity.
    pub agent: AgentState,
    /// Keys, token and password digests.
    pub keyring: Arc<Keyring>,
    /// Peer RPC client.
    pub client: RpcClient,
    /// Maintainer election.
    pub coordinator: Coordinator,
    /// Master-side member bookkeeping.
    pub membership: Membership,
    /// DAG operations.
    pub tasks: TaskService,
    /// Stored SSH credentials.
    pub credentials: CredentialService,
    /// Upgrade packages.
    pub packages: PackageService,
}

impl AgentContext {
    /// Open the stores named by `config` and assemble the agent.
    pub async fn bootstrap(config: Config) -> Result<Self> {
        let local = Arc::new(SqlitePersistence::from_path(config.local_db_path()).await?);
        let stores = match &config.cluster_database_url {
            Some(url) => {
                info!("Using MySQL cluster store");
                Stores::mysql(local.clone(), Arc::new(MySqlPersistence::connect(url).await?))
            }
            None => {
                let path = config.cluster_db_path();
                info!(path = %path.display(), "No cluster database configured, using a SQLite cluster store");
                Stores::sqlite(local, Arc::new(SqlitePersistence::from_path(path).await?))
            }
        };
        let root_password = take_root_password();
        Self::assemble(config, stores, root_password).await
    }

    /// Assemble the agent over already opened stores.
    pub async fn assemble(config: Config, stores: Stores, root_password: Option<String>) -> Result<Self> {
        let identity = restore_identity(&config, stores.local.as_ref()).await?;
        info!(
            agent = %identity.addr(),
            role = %identity.role,
            zone = %identity.zone,
            "Agent identity restored"
        );
        let agent = AgentState::new(identity, stores.local.clone());

        let sessions = Arc::new(SessionManager::new(config.session_ttl, config.session_cap));
        let keyring = Arc::new(Keyring::load(stores.local.clone(), sessions).await?);
        if let Some(password) = root_password {
            keyring.set_root_password(&password).await?;
            info!("Root password taken from the environment");
        }

        let client = RpcClient::new(stores.cluster.clone(), config.header_ttl)?;
        let coordinator = Coordinator::new(
            agent.clone(),
            stores.cluster.clone(),
            Arc::new(client.clone()),
            config.coordinator_interval,
        );
        let membership = Membership::new(stores.cluster.clone(), agent.clone(), keyring.clone());
        if let Err(e) = membership.register_self().await {
            warn!(error = %e, "Could not register this agent in the cluster store");
        }

        let registry = builtin_registry(&client, &keyring, &agent, &stores);
        let deps = EngineDeps::new(stores.clone(), registry, agent.clone());
        let pool = ExecutorPool::new(
            deps.clone(),
            ExecutorConfig {
                worker_count: config.worker_count,
                waiting_queue_size: config.waiting_queue_size,
            },
        );
        let tasks = TaskService::new(deps, pool);

        Ok(Self {
            credentials: CredentialService::new(stores.cluster.clone()),
            packages: PackageService::new(stores.cluster.clone()),
            config,
            stores,
            agent,
            keyring,
            client,
            coordinator,
            membership,
            tasks,
        })
    }
}

/// Built-in sub-task types.
pub fn builtin_registry(
    client: &RpcClient,
    keyring: &Arc<Keyring>,
    agent: &AgentState,
    stores: &Stores,
) -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    let c = client.clone();
    registry.register(
        REMOTE_SUB_DAG,
        TaskFlags::new().cancellable().continuable().rollbackable(),
        move || RemoteSubDag::new(c.clone()),
    );
    let c = client.clone();
    registry.register(CREATE_SUB_DAGS, rendezvous_flags(CREATE_SUB_DAGS), move || {
        CreateSubDags::new(c.clone())
    });
    let c = client.clone();
    registry.register(CHECK_DAG_STAGE, rendezvous_flags(CHECK_DAG_STAGE), move || {
        CheckDagStage::new(c.clone())
    });
    let c = client.clone();
    registry.register(WAIT_SUB_DAG_FINISH, rendezvous_flags(WAIT_SUB_DAG_FINISH), move || {
        WaitSubDagFinish::new(c.clone())
    });
    let c = client.clone();
    registry.register(PASS_SUB_DAGS, rendezvous_flags(PASS_SUB_DAGS), move || {
        PassSubDags::new(c.clone())
    });

    let (c, k) = (client.clone(), keyring.clone());
    registry.register(JOIN_TO_MASTER, join_flags(), move || {
        JoinToMaster::new(c.clone(), k.clone())
    });
    let (a, cluster) = (agent.clone(), stores.cluster.clone());
    registry.register(BE_FOLLOWER, join_flags(), move || {
        BeFollower::new(a.clone(), cluster.clone())
    });

    registry
}

/// Identity from the local store, else from the observer config file, else
/// a fresh SINGLE identity from `config`. The result is persisted.
async fn restore_identity(config: &Config, local: &dyn LocalStore) -> Result<AgentIdentity> {
    if let Some(identity) = local.get_identity().await? {
        if identity.ip != config.ip || identity.port != config.port {
            warn!(
                stored = %identity.addr(),
                configured = %format!("{}:{}", config.ip, config.port),
                "Configured address differs from the stored identity, keeping the stored one"
            );
        }
        return Ok(identity);
    }
    let identity = match ObserverConfig::read(config.observer_config_path()).await? {
        Some(observer) => match observer.identity(config.port, config.sql_port) {
            Some(identity) => {
                info!("Identity restored from observer config");
                identity
            }
            None => AgentIdentity::single(config.ip.clone(), config.port, config.sql_port),
        },
        None => AgentIdentity::single(config.ip.clone(), config.port, config.sql_port),
    };
    local.save_identity(&identity).await?;
    Ok(identity)
}

/// Read and remove the one-shot root password from the environment.
pub fn take_root_password() -> Option<String> {
    let password = std::env::var(ROOT_PASSWORD_ENV).ok()?;
    // SAFETY: called during startup before any thread reads the environment.
    unsafe { std::env::remove_var(ROOT_PASSWORD_ENV) };
    Some(password)
}

/// The running background workers of an agent.
pub struct BackgroundWorkers {
    pool: ExecutorPool,
    worker_handles: Vec<JoinHandle<()>>,
    coordinator_handle: JoinHandle<()>,
    scheduler_handle: JoinHandle<()>,
    synchronizer_handle: JoinHandle<()>,
    coordinator_shutdown: Arc<Notify>,
    scheduler_shutdown: Arc<Notify>,
    synchronizer_shutdown: Arc<Notify>,
}

impl BackgroundWorkers {
    /// Re-enqueue unfinished work and start every worker.
    pub async fn start(ctx: &AgentContext) -> Result<Self> {
        let pool = ctx.tasks.pool().clone();
        let worker_handles = pool.start();
        let requeued = pool.rehydrate().await?;
        if requeued > 0 {
            info!(requeued, "Re-enqueued unfinished sub-tasks");
        }

        if let Err(e) = ctx.coordinator.evaluate().await {
            warn!(error = %e, "Initial maintainer election failed");
        }
        let coordinator = ctx.coordinator.clone();
        let coordinator_shutdown = coordinator.shutdown_handle();
        let coordinator_handle = tokio::spawn(coordinator.run());

        let scheduler = Scheduler::new(ctx.tasks.clone(), SchedulerConfig::default())
            .maintainer(ctx.coordinator.is_maintainer())
            .with_maintainer_events(ctx.coordinator.subscribe(SCHEDULER_SUBSCRIPTION));
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(scheduler.run());

        let synchronizer = Synchronizer::new(
            ctx.stores.clone(),
            ctx.coordinator.clone(),
            ctx.client.clone(),
            ctx.agent.clone(),
            SynchronizerConfig {
                buffer: ctx.config.sync_buffer,
                ..SynchronizerConfig::default()
            },
        );
        let synchronizer_shutdown = synchronizer.shutdown_handle();
        let synchronizer_handle = tokio::spawn(synchronizer.run());

        info!(agent = %ctx.agent.addr(), "Background workers started");
        Ok(Self {
            pool,
            worker_handles,
            coordinator_handle,
            scheduler_handle,
            synchronizer_handle,
            coordinator_shutdown,
            scheduler_shutdown,
            synchronizer_shutdown,
        })
    }

    /// Signal every worker and wait for them.
    pub async fn shutdown(self) {
        info!("Background workers shutting down...");
        self.scheduler_shutdown.notify_one();
        self.synchronizer_shutdown.notify_one();
        self.coordinator_shutdown.notify_one();
        self.pool.shutdown();

        for (name, handle) in [
            ("scheduler", self.scheduler_handle),
            ("synchronizer", self.synchronizer_handle),
            ("coordinator", self.coordinator_handle),
        ] {
            if let Err(e) = handle.await {
                warn!(worker = name, error = %e, "Worker task ended abnormally");
            }
        }
        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Executor worker ended abnormally");
            }
        }
        info!("Background workers stopped");
    }
}
