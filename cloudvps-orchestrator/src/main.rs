use anyhow::Context;
use cloudvps_orchestrator::ip_allocator::StaticPoolIpAllocator;
use cloudvps_orchestrator::notifications::{
    self, LogNotificationSink, NotificationSink, RedisNotificationSink,
};
use cloudvps_orchestrator::placement::IdAllocator;
use cloudvps_orchestrator::provider_manager::ProviderManager;
use cloudvps_orchestrator::provisioning::recover_stale_provisioning;
use cloudvps_orchestrator::repository::{
    create_pool, InMemoryInstanceRepository, InstanceRepository, PgInstanceRepository,
};
use cloudvps_orchestrator::settings::Settings;
use cloudvps_orchestrator::{
    create_router, listener, AppState, LifecycleController, MetricsReader, ProvisioningWorkflow,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    // 1. Hypervisor
    let hypervisor = ProviderManager::get_provider(&settings.provider, &settings.hypervisor)?;
    hypervisor
        .authenticate()
        .await
        .context("Initial hypervisor authentication failed")?;
    tracing::info!("✅ [orchestrator] hypervisor '{}' reachable", settings.provider);

    // 2. Repository
    let repo: Arc<dyn InstanceRepository> = match &settings.database_url {
        Some(url) => {
            let pool = create_pool(url)
                .await
                .context("Failed to connect to Postgres")?;
            let pg = PgInstanceRepository::new(pool);
            pg.ensure_schema().await?;
            tracing::info!("✅ [orchestrator] connected to database");
            Arc::new(pg)
        }
        None => {
            tracing::warn!("⚠️ [orchestrator] DATABASE_URL not set, instances are kept in memory");
            Arc::new(InMemoryInstanceRepository::new())
        }
    };

    // 3. Bus
    let redis_client = settings
        .redis_url
        .as_deref()
        .map(notifications::create_client)
        .transpose()?;
    let notifier: Arc<dyn NotificationSink> = match &redis_client {
        Some(client) => Arc::new(RedisNotificationSink::new(client.clone())),
        None => {
            tracing::warn!("⚠️ [orchestrator] REDIS_URL not set, notifications go to the log");
            Arc::new(LogNotificationSink)
        }
    };

    let recovered = recover_stale_provisioning(
        repo.as_ref(),
        notifier.as_ref(),
        settings.provisioning.stale_creating_after,
        chrono::Utc::now(),
    )
    .await?;
    if recovered > 0 {
        tracing::warn!("🔁 [orchestrator] {} interrupted provisioning run(s) marked failed", recovered);
    }

    let shutdown = CancellationToken::new();
    let ips = Arc::new(StaticPoolIpAllocator::new(
        settings.ip_pool.public_prefix.clone(),
        settings.ip_pool.private_prefix.clone(),
    ));
    let leased = ips
        .restore(repo.as_ref())
        .await
        .context("Failed to restore address leases")?;
    tracing::info!("🌐 [orchestrator] {} address lease(s) restored", leased);
    let allocator = Arc::new(IdAllocator::new(settings.provisioning.vmid_range.clone()));

    let state = Arc::new(AppState {
        provisioning: Arc::new(ProvisioningWorkflow::new(
            hypervisor.clone(),
            repo.clone(),
            notifier.clone(),
            ips.clone(),
            allocator,
            settings.templates.clone(),
            settings.provisioning.clone(),
        )),
        lifecycle: Arc::new(
            LifecycleController::new(
                hypervisor.clone(),
                repo.clone(),
                notifier.clone(),
                ips,
                settings.lifecycle.clone(),
                settings.hypervisor.clone(),
            )
            .with_cancellation(shutdown.child_token()),
        ),
        metrics: Arc::new(MetricsReader::new(hypervisor, repo.clone())),
        repo,
        shutdown: shutdown.clone(),
        tasks: TaskTracker::new(),
    });

    // 4. Command listener
    if let Some(client) = redis_client {
        let state_redis = state.clone();
        tokio::spawn(async move {
            if let Err(e) = listener::run(state_redis, client).await {
                tracing::error!("❌ [listener] {:#}", e);
            }
        });
    }

    // 5. Admin API
    let app = create_router(state.clone());
    let listener = tokio::net::TcpListener::bind(settings.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.http_addr))?;
    tracing::info!("🚀 [orchestrator] listening on {}", settings.http_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 [orchestrator] shutting down");
            shutdown.cancel();
        })
        .await?;

    // Cancelled runs still record their failure before the process exits.
    state.tasks.close();
    tracing::info!(
        "⏳ [orchestrator] waiting for {} background task(s)",
        state.tasks.len()
    );
    state.tasks.wait().await;
    Ok(())
}
