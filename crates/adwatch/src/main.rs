use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use adwatch_core::{
    alerts::AdminAlerter,
    config::Config,
    forwarder::Forwarder,
    gateway::ClassifierGateway,
    matching::MatchEngine,
    model::MonitoredChannel,
    monitor::ConnectionSupervisor,
    pipeline::IngestionPipeline,
    ports::{ChannelSource, Notifier},
    quota::QuotaFlag,
    store::{MemoryStore, Store},
    topics::TopicAnchorCache,
    validator::MessageValidator,
};
use adwatch_llm::OpenAiClassifier;
use adwatch_telegram::{commands::AdminContext, Bot, TelegramNotifier, TelegramSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    adwatch_core::logging::init("adwatch");

    let config = Config::load()?;
    info!(
        channels = config.monitored_channels.len(),
        provider = %config.llm_provider,
        "starting adwatch"
    );

    let store = Arc::new(MemoryStore::open(&config.snapshot_path).await?);
    let bot = Bot::new(&config.telegram_bot_token);
    let source = Arc::new(TelegramSource::new(
        bot.clone(),
        config.channel_ids(),
        config.archive_depth,
    ));

    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(bot));
    let alerts = Arc::new(AdminAlerter::new(
        notifier.clone(),
        config.admin_user_ids.clone(),
        config.alert_cooldown,
    ));

    let quota = Arc::new(QuotaFlag::new());
    let classifier = Arc::new(OpenAiClassifier::new(
        config.llm_provider.clone(),
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let gateway = Arc::new(ClassifierGateway::new(
        classifier,
        quota.clone(),
        alerts.clone(),
        config.llm_provider.clone(),
    ));

    let topics = Arc::new(TopicAnchorCache::new());
    topics.warm(source.as_ref(), &config.monitored_channels).await;
    let validator = MessageValidator::new(
        config.monitored_channels.clone(),
        config.excluded_topics.clone(),
        topics,
    );

    let forwarder = Arc::new(Forwarder::new(store.clone(), notifier));
    let matcher = MatchEngine::new(store.clone(), forwarder);
    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        source.clone(),
        gateway,
        validator,
        matcher,
        config.monitored_channels.clone(),
        config.processing_stale_after,
    ));

    source
        .set_admin(Arc::new(AdminContext {
            pipeline: pipeline.clone(),
            quota,
            admins: config.admin_user_ids.clone(),
        }))
        .await;

    for spec in &config.monitored_channels {
        store
            .upsert_channel(MonitoredChannel {
                channel_id: spec.channel_id,
                topic_id: spec.topic_id,
                title: None,
                is_active: true,
            })
            .await?;
    }

    let cancel = CancellationToken::new();
    let rx = source.subscribe(&config.channel_ids()).await?;

    {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.consume(rx, cancel).await });
    }
    {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        let interval = config.recovery_interval;
        tokio::spawn(async move { pipeline.run_recovery_loop(interval, cancel).await });
    }
    {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        let interval = config.quota_recheck_interval;
        tokio::spawn(async move { pipeline.run_quota_recheck(interval, cancel).await });
    }
    {
        let store = store.clone();
        let cancel = cancel.clone();
        let interval = config.snapshot_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = store.save().await {
                            warn!("snapshot save failed: {e}");
                        }
                    }
                }
            }
        });
    }

    match pipeline.catch_up(config.startup_catchup_limit).await {
        Ok(stats) => info!(
            channels = stats.channels,
            processed = stats.processed,
            "startup catch-up finished"
        ),
        Err(e) => warn!("startup catch-up failed: {e}"),
    }

    let supervisor = ConnectionSupervisor::new(source, alerts, config.max_connection_retries);
    if let Err(e) = supervisor.run().await {
        error!("connection supervisor gave up: {e}");
        cancel.cancel();
        if let Err(e) = store.save().await {
            warn!("final snapshot save failed: {e}");
        }
        // Hand the restart decision to the process supervisor.
        std::process::exit(1);
    }

    cancel.cancel();
    store.save().await?;
    Ok(())
}
