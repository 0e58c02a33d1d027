use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    net::Download,
    payloads::SendMessageSetters,
    prelude::*,
    requests::{HasPayload, Payload, Request},
    types::{ChatId, Document, Message, ParseMode, UserId},
    utils::html,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::cooldown::format_remaining;
use crate::credentials::Tier;
use crate::dispenser::{Dispenser, GenerateOutcome};
use crate::stats::Counter;

const ADMIN_REFRESH_SECS: u64 = 180;
const MAX_UPLOAD_BYTES: u32 = 20 * 1024 * 1024;

pub struct AppState {
    cfg: Config,
    dispenser: Arc<Dispenser>,
    bot_username: String,
    /// Administrators of `roles.admin_chat_id`, refreshed periodically.
    chat_admins: DashMap<UserId, bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Help,
    Generate(Option<String>),
    Premium(Option<String>),
    Services,
    Stats,
    AddAccounts { tier: String, service: String },
    /// `addaccounts` with missing arguments.
    AddAccountsUsage,
}

/// Parses `<prefix><name>[@bot] args...`. Commands addressed to another bot
/// and unknown names yield `None`.
fn parse_command(text: &str, prefix: &str, bot_username: &str) -> Option<Command> {
    let rest = text.trim().strip_prefix(prefix)?;
    let mut parts = rest.split_whitespace();
    let head = parts.next()?;
    let name = match head.split_once('@') {
        Some((name, target)) => {
            if !target.eq_ignore_ascii_case(bot_username) {
                return None;
            }
            name
        }
        None => head,
    };
    let args: Vec<&str> = parts.collect();
    let joined = (!args.is_empty()).then(|| args.join(" "));

    let cmd = match name.to_ascii_lowercase().as_str() {
        "start" | "help" => Command::Help,
        "generate" => Command::Generate(joined),
        "premium" => Command::Premium(joined),
        "services" => Command::Services,
        "stats" => Command::Stats,
        "addaccounts" => match args.split_first() {
            Some((tier, service)) if !service.is_empty() => Command::AddAccounts {
                tier: tier.to_string(),
                service: service.join(" "),
            },
            _ => Command::AddAccountsUsage,
        },
        _ => return None,
    };
    Some(cmd)
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "send_message_dm" => "the user has not started a private chat with the bot",
        "get_chat_administrators" => "the bot must be a member of roles.admin_chat_id",
        "get_chat_member" => "the bot must be a member of roles.premium_chat_id",
        _ => "check bot permissions",
    }
}

async fn api_log<R>(ctx: &str, req: R) -> Option<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
{
    match req.send().await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(
                "API call failed ({ctx}): {:?}; hint: {}",
                e,
                ctx_perm_hint(ctx)
            );
            None
        }
    }
}

async fn reply(bot: &Bot, msg: &Message, text: impl Into<String>) {
    let _ = api_log(
        "send_message",
        bot.send_message(msg.chat.id, text.into())
            .parse_mode(ParseMode::Html),
    )
    .await;
}

/// Runs a store call on the blocking pool.
async fn with_dispenser<T, F>(state: &AppState, f: F) -> Result<T>
where
    F: FnOnce(&Dispenser) -> T + Send + 'static,
    T: Send + 'static,
{
    let d = state.dispenser.clone();
    tokio::task::spawn_blocking(move || f(&d))
        .await
        .context("store task panicked")
}

async fn refresh_admins(bot: &Bot, state: &AppState) -> Result<()> {
    let Some(chat_id) = state.cfg.roles.admin_chat_id else {
        return Ok(());
    };
    let admins = bot
        .get_chat_administrators(ChatId(chat_id))
        .send()
        .await
        .with_context(|| "get_chat_administrators")?;
    state.chat_admins.clear();
    for m in admins {
        state.chat_admins.insert(m.user.id, true);
    }
    Ok(())
}

async fn is_admin(bot: &Bot, state: &AppState, uid: UserId) -> bool {
    if state.cfg.roles.admin_users.contains(&uid.0) {
        return true;
    }
    if state.cfg.roles.admin_chat_id.is_some() && state.chat_admins.is_empty() {
        if let Err(e) = refresh_admins(bot, state).await {
            warn!("refresh_admins failed: {:?}", e);
        }
    }
    state.chat_admins.contains_key(&uid)
}

async fn is_premium(bot: &Bot, state: &AppState, uid: UserId) -> bool {
    if state.cfg.roles.premium_users.contains(&uid.0) {
        return true;
    }
    let Some(chat_id) = state.cfg.roles.premium_chat_id else {
        return false;
    };
    api_log("get_chat_member", bot.get_chat_member(ChatId(chat_id), uid))
        .await
        .is_some_and(|m| m.is_present())
}

fn help_text(state: &AppState, admin: bool) -> String {
    let p = html::escape(state.cfg.command_prefix());
    let mut out = format!(
        "<b>{}</b>\nHands out free and premium accounts for various services.\n\n\
         <b>General Commands</b>\n\
         {p}generate [service] - Get a free account\n\
         {p}premium [service] - Get a premium account (requires premium role)\n\
         {p}services - List available services\n\
         {p}stats - Show account statistics\n\
         {p}help - Show this help message\n",
        html::escape(state.cfg.title())
    );
    if admin {
        out.push_str(&format!(
            "\n<b>Admin Commands</b>\n\
             {p}addaccounts &lt;free|premium&gt; &lt;service&gt; - \
             send as the caption of a .txt file, one account per line\n"
        ));
    }
    out
}

async fn handle_generate(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    uid: UserId,
    tier: Tier,
    service: Option<String>,
) -> Result<()> {
    if tier == Tier::Premium && !is_premium(bot, state, uid).await {
        reply(bot, msg, "You need a premium role to use this command!").await;
        return Ok(());
    }

    let wanted = service.clone();
    let outcome = with_dispenser(state, move |d| {
        d.generate(uid.0, tier, wanted.as_deref(), Utc::now())
    })
    .await??;

    let issued = match outcome {
        GenerateOutcome::CooldownActive(left) => {
            reply(
                bot,
                msg,
                format!(
                    "You're on cooldown! Please wait {} before generating another {} account.",
                    format_remaining(left),
                    tier
                ),
            )
            .await;
            return Ok(());
        }
        GenerateOutcome::NotAvailable => {
            let scope = service
                .map(|s| format!(" (for {})", html::escape(&s)))
                .unwrap_or_default();
            reply(
                bot,
                msg,
                format!(
                    "Sorry, we're out of {} accounts right now!{}",
                    tier,
                    scope
                ),
            )
            .await;
            return Ok(());
        }
        GenerateOutcome::Issued(c) => c,
    };

    let mut text = format!(
        "<b>Here's your {} account!</b>\n<code>{}</code>",
        tier,
        html::escape(&issued.credential.record.credentials)
    );
    if state.cfg.display.show_service.unwrap_or(true) {
        text.push_str(&format!(
            "\n\nService: {}",
            html::escape(&issued.credential.service)
        ));
    }

    let delivered = api_log(
        "send_message_dm",
        bot.send_message(uid, text).parse_mode(ParseMode::Html),
    )
    .await
    .is_some();

    if delivered {
        let counted = with_dispenser(state, move |d| d.commit_issue(&issued)).await?;
        if let Err(e) = counted {
            warn!("stats increment failed after delivery to {}: {}", uid.0, e);
        }
        if !msg.chat.is_private() {
            reply(bot, msg, "Check your DMs for your account!").await;
        }
    } else {
        let released = with_dispenser(state, move |d| d.abandon_issue(&issued)).await?;
        if let Err(e) = released {
            warn!("cooldown release failed for {}: {}", uid.0, e);
        }
        reply(
            bot,
            msg,
            format!(
                "I couldn't DM you. Please start a private chat with @{} first!",
                html::escape(&state.bot_username)
            ),
        )
        .await;
    }
    Ok(())
}

async fn handle_services(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let (free, premium) = with_dispenser(state, |d| {
        Ok::<_, anyhow::Error>((d.services(Tier::Free)?, d.services(Tier::Premium)?))
    })
    .await??;

    let section = |title: &str, names: &[String]| {
        if names.is_empty() {
            format!("<b>{title}</b>\nNo {} available\n", title.to_lowercase())
        } else {
            let lines: Vec<String> = names
                .iter()
                .map(|s| format!("• {}", html::escape(s)))
                .collect();
            format!("<b>{title}</b>\n{}\n", lines.join("\n"))
        }
    };
    let text = format!(
        "<b>Available Services</b>\n\n{}\n{}",
        section("Free Services", &free),
        section("Premium Services", &premium)
    );
    reply(bot, msg, text).await;
    Ok(())
}

async fn handle_stats(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let o = with_dispenser(state, |d| d.overview()).await??;

    let mut text = format!(
        "<b>Account Statistics</b>\n\n\
         <b>Free Accounts</b>: Available: {}\n\
         <b>Premium Accounts</b>: Available: {}\n\n\
         <b>Total Generated</b>\nFree: {}\nPremium: {}\n",
        o.availability.totals.free,
        o.availability.totals.premium,
        o.stats.get(Counter::FreeGenerated),
        o.stats.get(Counter::PremiumGenerated),
    );
    if !o.availability.services.is_empty() {
        text.push_str("\n<b>Services Breakdown</b>\n");
        for (service, c) in &o.availability.services {
            text.push_str(&format!(
                "<b>{}</b>: Free: {}, Premium: {}\n",
                html::escape(service),
                c.free,
                c.premium
            ));
        }
    }
    reply(bot, msg, text).await;
    Ok(())
}

async fn download_batch(bot: &Bot, doc: &Document) -> Result<String> {
    let file = bot.get_file(doc.file.id.clone()).send().await.context("get_file")?;
    let mut buf: Vec<u8> = Vec::with_capacity(doc.file.size as usize);
    bot.download_file(&file.path, &mut buf)
        .await
        .context("download_file")?;
    String::from_utf8(buf).map_err(|_| anyhow!("accounts file is not valid UTF-8"))
}

async fn handle_add_accounts(
    bot: &Bot,
    state: &AppState,
    msg: &Message,
    uid: UserId,
    tier: &str,
    service: &str,
) -> Result<()> {
    if !is_admin(bot, state, uid).await {
        reply(bot, msg, "You don't have permission to use this command.").await;
        return Ok(());
    }
    let Ok(tier) = tier.parse::<Tier>() else {
        reply(bot, msg, "Account type must be either 'free' or 'premium'.").await;
        return Ok(());
    };
    let Some(doc) = msg.document() else {
        reply(bot, msg, "Please attach a .txt file with one account per line.").await;
        return Ok(());
    };
    let is_txt = doc
        .file_name
        .as_deref()
        .is_some_and(|n| n.to_ascii_lowercase().ends_with(".txt"));
    if !is_txt {
        reply(bot, msg, "Please upload a .txt file with one account per line.").await;
        return Ok(());
    }
    if doc.file.size > MAX_UPLOAD_BYTES {
        reply(bot, msg, "That file is too large.").await;
        return Ok(());
    }

    let text = match download_batch(bot, doc).await {
        Ok(t) => t,
        Err(e) => {
            warn!("accounts file download failed: {:?}", e);
            reply(bot, msg, "Failed to process the accounts file.").await;
            return Ok(());
        }
    };

    let svc = service.to_string();
    match with_dispenser(state, move |d| d.upload_batch(tier, &svc, &text)).await? {
        Ok(added) => {
            info!("admin {} uploaded {} {} credentials for {}", uid.0, added, tier, service);
            reply(
                bot,
                msg,
                format!(
                    "Successfully added {} {} accounts for {}!",
                    added,
                    tier,
                    html::escape(service)
                ),
            )
            .await;
        }
        Err(e) if e.downcast_ref::<crate::error::StorageError>().is_some() => return Err(e),
        Err(e) => {
            reply(bot, msg, html::escape(&e.to_string())).await;
        }
    }
    Ok(())
}

async fn handle_message(bot: &Bot, state: &AppState, msg: &Message) -> Result<()> {
    let Some(uid) = msg.from.as_ref().map(|u| u.id) else {
        return Ok(());
    };
    let Some(text) = msg.text().or_else(|| msg.caption()) else {
        return Ok(());
    };
    let Some(cmd) = parse_command(text, state.cfg.command_prefix(), &state.bot_username) else {
        return Ok(());
    };

    match cmd {
        Command::Help => {
            let admin = is_admin(bot, state, uid).await;
            reply(bot, msg, help_text(state, admin)).await;
        }
        Command::Generate(service) => {
            handle_generate(bot, state, msg, uid, Tier::Free, service).await?;
        }
        Command::Premium(service) => {
            handle_generate(bot, state, msg, uid, Tier::Premium, service).await?;
        }
        Command::Services => handle_services(bot, state, msg).await?,
        Command::Stats => handle_stats(bot, state, msg).await?,
        Command::AddAccounts { tier, service } => {
            handle_add_accounts(bot, state, msg, uid, &tier, &service).await?;
        }
        Command::AddAccountsUsage => {
            let p = html::escape(state.cfg.command_prefix());
            reply(
                bot,
                msg,
                format!(
                    "Usage: {p}addaccounts &lt;free|premium&gt; &lt;service&gt; \
                     as the caption of a .txt file"
                ),
            )
            .await;
        }
    }
    Ok(())
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry().branch(Update::filter_message().endpoint(
        |bot: Bot, state: Arc<AppState>, msg: Message| async move {
            if let Err(e) = handle_message(&bot, &state, &msg).await {
                warn!("command failed in chat {}: {:?}", msg.chat.id.0, e);
                reply(&bot, &msg, "An error occurred while handling your request.").await;
            }
            Ok(())
        },
    ))
}

pub async fn run(cfg: Config, dispenser: Arc<Dispenser>) -> Result<()> {
    if cfg.bot.token.trim().is_empty() {
        return Err(anyhow!("bot.token is required to run the bot"));
    }

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let bot = Bot::new(cfg.bot.token.clone());
    let me = bot.get_me().send().await?;
    let bot_username = me.user.username.clone().unwrap_or_else(|| "bot".into());

    let state = Arc::new(AppState {
        cfg,
        dispenser,
        bot_username,
        chat_admins: DashMap::new(),
    });

    if let Err(e) = refresh_admins(&bot, &state).await {
        warn!("refresh_admins failed (startup): {:?}", e);
    }

    let bot_admin = bot.clone();
    let state_admin = state.clone();
    let mut shutdown_rx_admin = shutdown_tx.subscribe();
    let h_admin = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(ADMIN_REFRESH_SECS));
        loop {
            tokio::select! {
                _ = shutdown_rx_admin.recv() => { break; }
                _ = ticker.tick() => {
                    if let Err(e) = refresh_admins(&bot_admin, &state_admin).await {
                        warn!("refresh_admins failed: {:?}", e);
                    }
                }
            }
        }
    });

    info!("Start polling as @{}", state.bot_username);

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![state])
        .default_handler(|upd| async move {
            let _ = upd;
        })
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    let _ = shutdown_tx.send(());
    let _ = h_admin.await;

    Ok(())
}
