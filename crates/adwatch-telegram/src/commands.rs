//! Operator commands over private chat.
//!
//! Only configured admin users are answered; everyone else is ignored
//! silently so the bot gives away nothing about itself.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::{error, info};

use adwatch_core::{domain::UserId, pipeline::IngestionPipeline, quota::QuotaFlag};

const DEFAULT_BATCH: usize = 50;

pub struct AdminContext {
    pub pipeline: Arc<IngestionPipeline>,
    pub quota: Arc<QuotaFlag>,
    pub admins: Vec<UserId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdminCommand {
    Status,
    Recover,
    Reprocess(usize),
    Refilter(usize),
    Help,
}

pub(crate) fn parse_command(text: &str) -> Option<AdminCommand> {
    let mut parts = text.trim().split_whitespace();
    let head = parts.next()?;
    let arg = parts.next().and_then(|s| s.parse::<usize>().ok());

    match head {
        "/status" => Some(AdminCommand::Status),
        "/recover" => Some(AdminCommand::Recover),
        "/reprocess" => Some(AdminCommand::Reprocess(arg.unwrap_or(DEFAULT_BATCH))),
        "/refilter" => Some(AdminCommand::Refilter(arg.unwrap_or(DEFAULT_BATCH))),
        "/help" | "/start" => Some(AdminCommand::Help),
        _ => None,
    }
}

pub(crate) async fn handle_admin_message(
    bot: Bot,
    msg: Message,
    ctx: Arc<AdminContext>,
) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if !ctx.admins.contains(&UserId(user.id.0 as i64)) {
        return Ok(());
    }
    let Some(command) = msg.text().and_then(parse_command) else {
        return Ok(());
    };

    info!(user = user.id.0, ?command, "admin command");
    let reply = run_command(&ctx, command).await;
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

async fn run_command(ctx: &AdminContext, command: AdminCommand) -> String {
    match command {
        AdminCommand::Status => {
            if ctx.quota.is_exhausted() {
                let since = ctx
                    .quota
                    .exhausted_since()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                format!("classification PAUSED (quota exhausted since {since})")
            } else {
                "running, classification active".to_string()
            }
        }
        AdminCommand::Recover => match ctx.pipeline.run_recovery_scan().await {
            Ok(stats) => format!(
                "recovery: scanned {}, reprocessed {}, deleted {}, skipped {}",
                stats.scanned, stats.reprocessed, stats.deleted, stats.skipped
            ),
            Err(e) => {
                error!("recovery command failed: {e}");
                format!("recovery failed: {e}")
            }
        },
        AdminCommand::Reprocess(limit) => {
            match ctx
                .pipeline
                .reprocess_recent(limit, None, None, true, false)
                .await
            {
                Ok(stats) => format!(
                    "reprocess: selected {}, reprocessed {}, skipped {}, failed {}",
                    stats.selected, stats.reprocessed, stats.skipped, stats.failed
                ),
                Err(e) => {
                    error!("reprocess command failed: {e}");
                    format!("reprocess failed: {e}")
                }
            }
        }
        AdminCommand::Refilter(limit) => match ctx.pipeline.refilter_recent(limit, None).await {
            Ok(stats) => format!(
                "refilter: {} ads checked, {} matched, {} notifications sent",
                stats.ads, stats.matched, stats.delivered
            ),
            Err(e) => {
                error!("refilter command failed: {e}");
                format!("refilter failed: {e}")
            }
        },
        AdminCommand::Help => "\
/status - pipeline and quota state\n\
/recover - sweep stuck and deferred messages now\n\
/reprocess [n] - re-classify the n most recent messages\n\
/refilter [n] - re-match the n most recent ads against filters"
            .to_string(),
    }
}
