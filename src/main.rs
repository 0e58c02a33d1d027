use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bot;
mod config;
mod cooldown;
mod credentials;
mod dispenser;
mod error;
mod password;
mod stats;
mod storage;
mod web;

use config::{load_config, validate_config};
use dispenser::Dispenser;

const USAGE: &str = "usage: tg-dispenser <bot|web> [--config <path>]\n       \
tg-dispenser hash-password <password>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Mode {
    Bot,
    Web,
    HashPassword(String),
}

fn parse_mode(args: &[String]) -> Result<Mode> {
    match args.first().map(String::as_str) {
        Some("bot") => Ok(Mode::Bot),
        Some("web") => Ok(Mode::Web),
        Some("hash-password") => args
            .get(1)
            .cloned()
            .map(Mode::HashPassword)
            .ok_or_else(|| anyhow!("hash-password needs a password\n{USAGE}")),
        _ => Err(anyhow!(USAGE)),
    }
}

fn parse_config_arg(args: &[String]) -> Option<PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = parse_mode(&args)?;

    if let Mode::HashPassword(pw) = &mode {
        println!("{}", password::hash_password(pw));
        return Ok(());
    }

    let config_path = parse_config_arg(&args).unwrap_or_else(|| PathBuf::from("config.yaml"));
    let cfg = load_config(&config_path)?;
    validate_config(&cfg)?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cfg.bot.log_level.clone().unwrap_or_else(|| "info".into()))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let data_dir = cfg.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    info!(
        "data dir {} (cooldowns: free={}s premium={}s)",
        data_dir.display(),
        cfg.cooldown.free,
        cfg.cooldown.premium
    );
    let dispenser = Arc::new(Dispenser::from_config(&cfg));

    match mode {
        Mode::Bot => bot::run(cfg, dispenser).await,
        Mode::Web => web::run(config_path, cfg, dispenser).await,
        Mode::HashPassword(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_modes_and_config_path() {
        assert_eq!(parse_mode(&args(&["bot"])).unwrap(), Mode::Bot);
        assert_eq!(
            parse_mode(&args(&["web", "--config", "/etc/d.json"])).unwrap(),
            Mode::Web
        );
        assert_eq!(
            parse_mode(&args(&["hash-password", "pw"])).unwrap(),
            Mode::HashPassword("pw".into())
        );
        assert!(parse_mode(&args(&["hash-password"])).is_err());
        assert!(parse_mode(&args(&[])).is_err());

        assert_eq!(
            parse_config_arg(&args(&["web", "--config", "/etc/d.json"])),
            Some(PathBuf::from("/etc/d.json"))
        );
        assert_eq!(parse_config_arg(&args(&["bot", "--config"])), None);
    }
}
