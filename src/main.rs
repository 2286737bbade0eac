use repeater::{Config, Database, IncomingMessage, Repeater};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Reads `<group> <user> <text>` lines from stdin, or `/command ...` lines:
//   /ban <group> <fingerprint>[|reason]   /unban <group> <fingerprint>
//   /blacklist <group> <text>             /unblacklist <group> <text>
//   /clear <fingerprint>                  /learned <group>
//   /recent                               /flush
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load()?;
    info!("Loaded configuration: {:?}", config);
    let bot_id: i64 = env::var("BOT_ID").ok().and_then(|v| v.parse().ok()).unwrap_or(0);
    let reply_probability: f64 = env::var("REPLY_PROBABILITY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.5);

    let db = Database::open(&config.database_url)?;
    db.execute_init()?;
    let engine = Repeater::open(config, Arc::new(db)).await?;
    let background = engine.spawn_background();
    info!("Repeater ready (bot id {})", bot_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&engine, bot_id, reply_probability, line.trim()).await,
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin, shutting down: {}", e);
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    engine.shutdown(background).await?;
    Ok(())
}

async fn handle_line(engine: &Arc<Repeater>, bot_id: i64, probability: f64, line: &str) {
    if line.is_empty() {
        return;
    }
    if let Some(command) = line.strip_prefix('/') {
        handle_command(engine, command).await;
        return;
    }

    let mut parts = line.splitn(3, ' ');
    let (Some(group), Some(user), Some(text)) = (parts.next(), parts.next(), parts.next()) else {
        warn!("Expected '<group> <user> <text>', got '{}'", line);
        return;
    };
    let (Ok(group_id), Ok(user_id)) = (group.parse::<i64>(), user.parse::<i64>()) else {
        warn!("Group and user must be numeric: '{}'", line);
        return;
    };

    let Some(observation) = engine.observe(IncomingMessage::new(group_id, user_id, bot_id, text)) else {
        return;
    };
    let reply = observation.repeat.clone().or_else(|| {
        observation
            .fingerprint()
            .and_then(|fp| engine.maybe_reply(fp, group_id, probability))
    });
    if let Some(reply) = reply {
        println!("[{}] {}", group_id, reply);
        // The bot's own line goes into the log like any other.
        engine.observe(IncomingMessage::new(group_id, bot_id, bot_id, &reply));
    }
}

/// Driver commands. Fingerprints and texts run to the end of the line, so
/// they may contain spaces.
#[derive(Debug, PartialEq)]
enum Command<'a> {
    Ban { group_id: i64, fingerprint: &'a str, reason: &'a str },
    Unban { group_id: i64, fingerprint: &'a str },
    Blacklist { group_id: i64, text: &'a str },
    Unblacklist { group_id: i64, text: &'a str },
    Learned { group_id: i64 },
    Clear { fingerprint: &'a str },
    Recent,
    Flush,
    Stats,
}

fn parse_command(command: &str) -> Option<Command<'_>> {
    let (name, args) = command
        .split_once(' ')
        .map(|(name, args)| (name, args.trim()))
        .unwrap_or((command, ""));
    let grouped = move || {
        let (group, rest) = args.split_once(' ').unwrap_or((args, ""));
        let rest = rest.trim();
        group.parse::<i64>().ok().map(|group_id| (group_id, rest))
    };

    let parsed = match name {
        "ban" => {
            let (group_id, rest) = grouped()?;
            let (fingerprint, reason) = rest.split_once('|').unwrap_or((rest, "manual"));
            Command::Ban {
                group_id,
                fingerprint: fingerprint.trim(),
                reason: reason.trim(),
            }
        }
        "unban" => {
            let (group_id, fingerprint) = grouped()?;
            Command::Unban { group_id, fingerprint }
        }
        "blacklist" => {
            let (group_id, text) = grouped()?;
            Command::Blacklist { group_id, text }
        }
        "unblacklist" => {
            let (group_id, text) = grouped()?;
            Command::Unblacklist { group_id, text }
        }
        "learned" => Command::Learned { group_id: grouped()?.0 },
        "clear" => Command::Clear { fingerprint: args },
        "recent" => Command::Recent,
        "flush" => Command::Flush,
        "stats" => Command::Stats,
        _ => return None,
    };
    let empty_arg = match &parsed {
        Command::Ban { fingerprint, .. }
        | Command::Unban { fingerprint, .. }
        | Command::Clear { fingerprint } => fingerprint.is_empty(),
        Command::Blacklist { text, .. } | Command::Unblacklist { text, .. } => text.is_empty(),
        _ => false,
    };
    (!empty_arg).then_some(parsed)
}

async fn handle_command(engine: &Arc<Repeater>, command: &str) {
    let Some(parsed) = parse_command(command) else {
        warn!("Unknown or incomplete command '/{}'", command);
        return;
    };
    match parsed {
        Command::Ban { group_id, fingerprint, reason } => {
            println!("{}", engine.ban(fingerprint, group_id, reason))
        }
        Command::Unban { group_id, fingerprint } => {
            println!("{}", engine.unban(fingerprint, group_id))
        }
        Command::Blacklist { group_id, text } => {
            println!("{:?}", engine.blacklist(group_id, text))
        }
        Command::Unblacklist { group_id, text } => {
            println!("{}", engine.unblacklist(group_id, text))
        }
        Command::Learned { group_id } => match engine.learned_in_group(group_id, 20).await {
            Ok(keywords) => println!("{}", keywords.join(" | ")),
            Err(e) => warn!("Failed to list learned fingerprints: {}", e),
        },
        Command::Clear { fingerprint } => println!("{}", engine.clear(fingerprint)),
        Command::Recent => {
            for (group_id, message) in engine.recent_per_group() {
                println!("[{}] {}: {}", group_id, message.user_id, message.plain_text);
            }
        }
        Command::Flush => match engine.flush_now().await {
            Ok(report) => println!("{:?}", report),
            Err(e) => warn!("Flush failed: {}", e),
        },
        Command::Stats => println!("{:?}", engine.stats()),
    }
}
