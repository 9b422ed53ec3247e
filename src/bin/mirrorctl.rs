//! mirrorctl - operator CLI for the mirror domain pool
//!
//! Usage:
//!   mirrorctl add [--activate] <domain>...   Register domains and issue certificates
//!   mirrorctl issue [--limit N]              Issue certificates for domains lacking one
//!   mirrorctl activate [domain...]           Activate domains (all ready ones if none given)
//!   mirrorctl deactivate <domain>... | --all Return active domains to pending
//!   mirrorctl delete <domain>...             Remove domains
//!   mirrorctl list [--status S]              List domains
//!   mirrorctl events [--type T] [--limit N]  Show the audit log
//!   mirrorctl sync                           Regenerate nginx config and reload

use anyhow::{bail, Context, Result};
use mirrorgate::acme::{CertbotIssuer, LiveCertificates};
use mirrorgate::admin::{Admin, AdminAction};
use mirrorgate::clock::SystemClock;
use mirrorgate::config::Config;
use mirrorgate::db::{Database, DomainStatus};
use mirrorgate::events::EventKind;
use mirrorgate::sync::ConfigSync;
use mirrorgate::{PKG_NAME, VERSION};
use std::env;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

/// Default config location when neither --config nor MIRRORGATE_CONFIG is set
const DEFAULT_CONFIG_PATH: &str = "/etc/mirrorgate/mirrorgate.toml";

const DEFAULT_EVENT_LIMIT: usize = 50;

#[derive(Debug, PartialEq)]
enum Command {
    Action(AdminAction),
    Help,
    Version,
}

#[derive(Debug, PartialEq)]
struct Invocation {
    config_path: Option<PathBuf>,
    json: bool,
    command: Command,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let invocation = parse_args(&args)?;

    let action = match invocation.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("{} {}", PKG_NAME, VERSION);
            return Ok(());
        }
        Command::Action(action) => action,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mirrorgate=warn".parse().context("invalid log directive")?),
        )
        .init();

    let config_path = invocation
        .config_path
        .or_else(|| env::var_os("MIRRORGATE_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let action = read_stdin_inputs(action)?;

    let db = Arc::new(Database::open(&config.storage.database)?);
    let admin = Admin::new(
        db.clone(),
        Arc::new(CertbotIssuer::from_config(&config.acme)?),
        Arc::new(ConfigSync::from_config(db, &config)?),
        LiveCertificates::new(&config.acme.live_dir),
        config.acme.min_valid_days,
        Arc::new(SystemClock),
    );

    let outcome = admin.dispatch(action).await?;
    if invocation.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print!("{}", outcome);
    }
    Ok(())
}

/// `add -` reads domains from stdin, one per line
fn read_stdin_inputs(action: AdminAction) -> Result<AdminAction> {
    match action {
        AdminAction::AddDomains { inputs, activate } if inputs.iter().any(|i| i == "-") => {
            let mut all: Vec<String> = inputs.into_iter().filter(|i| i != "-").collect();
            for line in std::io::stdin().lock().lines() {
                all.extend(line?.split_whitespace().map(str::to_string));
            }
            Ok(AdminAction::AddDomains { inputs: all, activate })
        }
        other => Ok(other),
    }
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config_path = None;
    let mut json = false;
    let mut rest = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--json" => json = true,
            _ => rest.push(arg.clone()),
        }
    }

    Ok(Invocation {
        config_path,
        json,
        command: parse_command(&rest)?,
    })
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some((name, args)) = args.split_first() else {
        return Ok(Command::Help);
    };

    let action = match name.as_str() {
        "help" | "-h" | "--help" => return Ok(Command::Help),
        "version" | "-V" | "--version" => return Ok(Command::Version),
        "add" => {
            let activate = args.iter().any(|a| a == "--activate");
            let inputs: Vec<String> = args.iter().filter(|a| *a != "--activate").cloned().collect();
            if inputs.is_empty() {
                bail!("add needs at least one domain (or - to read stdin)");
            }
            AdminAction::AddDomains { inputs, activate }
        }
        "issue" => {
            let (limit, rest) = take_option(args, "--limit")?;
            reject_extra(&rest, "issue")?;
            AdminAction::IssueMissing {
                limit: limit.map(|l| parse_number(&l, "--limit")).transpose()?,
            }
        }
        "activate" => AdminAction::Activate { hosts: args.to_vec() },
        "deactivate" => {
            let all = args.iter().any(|a| a == "--all");
            let hosts: Vec<String> = args.iter().filter(|a| *a != "--all").cloned().collect();
            match (all, hosts.is_empty()) {
                (true, true) => AdminAction::Deactivate { hosts: Vec::new() },
                (false, false) => AdminAction::Deactivate { hosts },
                (true, false) => bail!("deactivate takes either domains or --all, not both"),
                (false, true) => bail!("deactivate needs domains or --all"),
            }
        }
        "delete" | "rm" => {
            if args.is_empty() {
                bail!("delete needs at least one domain");
            }
            AdminAction::Delete { hosts: args.to_vec() }
        }
        "list" | "ls" => {
            let (status, rest) = take_option(args, "--status")?;
            reject_extra(&rest, "list")?;
            let status = status
                .map(|s| DomainStatus::from_str(&s).with_context(|| format!("unknown status {:?}", s)))
                .transpose()?;
            AdminAction::List { status }
        }
        "events" => {
            let (kind, rest) = take_option(args, "--type")?;
            let (limit, rest) = take_option(&rest, "--limit")?;
            reject_extra(&rest, "events")?;
            AdminAction::Events {
                kind: kind
                    .map(|k| EventKind::from_str(&k).with_context(|| format!("unknown event type {:?}", k)))
                    .transpose()?,
                limit: limit
                    .map(|l| parse_number(&l, "--limit"))
                    .transpose()?
                    .unwrap_or(DEFAULT_EVENT_LIMIT),
            }
        }
        "sync" => {
            reject_extra(args, "sync")?;
            AdminAction::Sync
        }
        other => bail!("unknown command {:?} (try `mirrorctl help`)", other),
    };

    Ok(Command::Action(action))
}

/// Pull `--name value` out of the arguments
fn take_option(args: &[String], name: &str) -> Result<(Option<String>, Vec<String>)> {
    let mut value = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == name {
            value = Some(iter.next().with_context(|| format!("{} needs a value", name))?.clone());
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((value, rest))
}

fn reject_extra(rest: &[String], command: &str) -> Result<()> {
    if let Some(extra) = rest.first() {
        bail!("unexpected argument {:?} for {}", extra, command);
    }
    Ok(())
}

fn parse_number(value: &str, name: &str) -> Result<usize> {
    value
        .parse()
        .with_context(|| format!("{} expects a number, got {:?}", name, value))
}

fn print_help() {
    println!(r#"
mirrorctl - manage the mirror domain pool

USAGE:
    mirrorctl [--config PATH] [--json] <command> [options]

COMMANDS:
    add [--activate] <domain>...   Register domains (URLs accepted), issue
                                   certificates, optionally activate; `-` reads stdin
    issue [--limit N]              Issue certificates for pending domains without SSL
    activate [domain...]           Activate domains that have SSL (all if none given)
    deactivate <domain>...         Return active domains to pending
    deactivate --all               Return every active domain to pending
    delete <domain>...             Remove domains
    list [--status S]              List domains (pending, active, blocked)
    events [--type T] [--limit N]  Show the audit log, newest first
    sync                           Regenerate nginx config, validate and reload

    help                           Show this help
    version                        Show version

CONFIG:
    --config PATH, or MIRRORGATE_CONFIG, or {}
"#, DEFAULT_CONFIG_PATH);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &str) -> Vec<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    fn action(s: &str) -> AdminAction {
        match parse_args(&args(s)).unwrap().command {
            Command::Action(action) => action,
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_add() {
        assert_eq!(
            action("add --activate a.example.com https://B.example.com/"),
            AdminAction::AddDomains {
                inputs: args("a.example.com https://B.example.com/"),
                activate: true,
            }
        );
        assert!(parse_args(&args("add")).is_err());
    }

    #[test]
    fn test_parse_global_options() {
        let inv = parse_args(&args("--json list -c /tmp/m.toml --status active")).unwrap();
        assert!(inv.json);
        assert_eq!(inv.config_path, Some(PathBuf::from("/tmp/m.toml")));
        assert_eq!(
            inv.command,
            Command::Action(AdminAction::List {
                status: Some(DomainStatus::Active)
            })
        );
    }

    #[test]
    fn test_parse_events_and_issue() {
        assert_eq!(
            action("events --type domain_blocked --limit 5"),
            AdminAction::Events {
                kind: Some(EventKind::DomainBlocked),
                limit: 5
            }
        );
        assert_eq!(
            action("events"),
            AdminAction::Events {
                kind: None,
                limit: DEFAULT_EVENT_LIMIT
            }
        );
        assert_eq!(action("issue --limit 3"), AdminAction::IssueMissing { limit: Some(3) });
        assert!(parse_args(&args("issue --limit x")).is_err());
        assert!(parse_args(&args("events --type nope")).is_err());
    }

    #[test]
    fn test_parse_deactivate() {
        assert_eq!(action("deactivate --all"), AdminAction::Deactivate { hosts: vec![] });
        assert_eq!(
            action("deactivate a.example.com"),
            AdminAction::Deactivate {
                hosts: args("a.example.com")
            }
        );
        assert!(parse_args(&args("deactivate")).is_err());
        assert!(parse_args(&args("deactivate --all a.example.com")).is_err());
    }

    #[test]
    fn test_parse_misc() {
        assert_eq!(parse_args(&[]).unwrap().command, Command::Help);
        assert_eq!(parse_args(&args("--version")).unwrap().command, Command::Version);
        assert_eq!(action("activate"), AdminAction::Activate { hosts: vec![] });
        assert_eq!(action("sync"), AdminAction::Sync);
        assert!(parse_args(&args("sync now")).is_err());
        assert!(parse_args(&args("frobnicate")).is_err());
        assert!(parse_args(&args("list --status weird")).is_err());
    }
}
