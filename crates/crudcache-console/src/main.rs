//! crudcache - command-line admin console for reference data.
//!
//! Lists, searches and edits states, cities, companies, departments, skills
//! and shifts through the optimistic cache. Each mutation prints the list as
//! it looks immediately (optimistic) and again once the server has answered.

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crudcache_core::models::{
    City, Company, Department, NewState, Shift, Skill, State,
};
use crudcache_core::utils::truncate_string;
use crudcache_core::{
    Backend, BackendFamily, Config, Console, Entity, EntityFacade, FieldUpdates, InMemory,
};

// ============================================================================
// Constants
// ============================================================================

/// Width of the name column in list output
const NAME_WIDTH: usize = 32;

const USAGE: &str = "\
Usage: crudcache [--demo] [--fail] [--log-file <dir>] <command>

Commands:
  config                      Show the active configuration
  config url <url>            Save the API base URL
  <entity> list
  <entity> search <text>
  <entity> show <id>
  <entity> create '<json>'    e.g. states create '{\"name\":\"Ohio\",\"code\":\"OH\"}'
  <entity> rename <id> <name>
  <entity> delete <id>

Entities: states, cities, companies, departments, skills, shifts

Options:
  --demo             Use a seeded in-memory backend instead of the API
  --fail             With --demo, make the next write fail to show a rollback
  --log-file <dir>   Also write logs to a daily file in <dir>

Set RUST_LOG (e.g. RUST_LOG=debug) to control log output.";

struct Args {
    demo: bool,
    fail: bool,
    log_dir: Option<PathBuf>,
    command: Vec<String>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        demo: false,
        fail: false,
        log_dir: None,
        command: Vec::new(),
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--demo" => args.demo = true,
            "--fail" => args.fail = true,
            "--log-file" => {
                let dir = iter.next().context("--log-file needs a directory")?;
                args.log_dir = Some(PathBuf::from(dir));
            }
            "-h" | "--help" => args.command.clear(),
            _ => args.command.push(arg),
        }
    }
    Ok(args)
}

/// Initialize the tracing subscriber for logging.
/// The returned guard flushes the log file when dropped.
fn init_tracing(log_dir: Option<&PathBuf>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "crudcache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args = parse_args()?;
    let _guard = init_tracing(args.log_dir.as_ref());

    let mut config = Config::load()?;
    config.apply_env();

    let command: Vec<&str> = args.command.iter().map(String::as_str).collect();
    match command.as_slice() {
        [] => {
            println!("{}", USAGE);
            Ok(())
        }
        ["config"] => show_config(&config),
        ["config", "url", url] => {
            let mut saved = Config::load()?;
            saved.api_base_url = url.to_string();
            saved.save()?;
            println!("Saved API URL to {}", Config::config_path()?.display());
            Ok(())
        }
        [entity, action @ ..] if args.demo => {
            info!("using in-memory demo backend");
            let console = demo_console(args.fail).await?;
            run(&console, entity, action, &config).await
        }
        [entity, action @ ..] => {
            info!(api = %config.api_base_url, "using REST backend");
            let console = Console::new(&config.api_client()?);
            run(&console, entity, action, &config).await
        }
    }
}

fn show_config(config: &Config) -> Result<()> {
    println!("config file:      {}", Config::config_path()?.display());
    println!("api base url:     {}", config.api_base_url);
    println!(
        "api token:        {}",
        if config.api_token.is_some() { "set" } else { "not set" }
    );
    println!("request timeout:  {}s", config.request_timeout_secs);
    println!("lists stale after {} min", config.stale_minutes);
    Ok(())
}

async fn run<F: BackendFamily>(
    console: &Console<F>,
    entity: &str,
    action: &[&str],
    config: &Config,
) -> Result<()> {
    match entity {
        "states" => run_entity(&console.states, action, config).await,
        "cities" => run_entity(&console.cities, action, config).await,
        "companies" => run_entity(&console.companies, action, config).await,
        "departments" => run_entity(&console.departments, action, config).await,
        "skills" => run_entity(&console.skills, action, config).await,
        "shifts" => run_entity(&console.shifts, action, config).await,
        other => bail!("unknown entity '{}'\n\n{}", other, USAGE),
    }
}

async fn run_entity<E: Entity, B: Backend<E>>(
    facade: &EntityFacade<E, B>,
    action: &[&str],
    config: &Config,
) -> Result<()> {
    facade.ensure_fresh(config.stale_after()).await?;

    match action {
        [] | ["list"] => print_list(facade, &facade.list()),
        ["search", text @ ..] => print_list(facade, &facade.search(&text.join(" "))),
        ["show", id] => {
            let entity = facade
                .get_by_id(id)
                .with_context(|| format!("no {} with id {}", E::KIND, id))?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
        }
        ["create", json] => {
            let draft: E::Draft = serde_json::from_str(json)
                .with_context(|| format!("invalid {} JSON", E::KIND))?;
            let pending = facade.create(draft)?;
            println!("optimistic:");
            print_list(facade, &facade.list());
            match pending.await {
                Some(saved) => println!("saved {} {}", E::KIND, saved.id()),
                None => println!("create failed, rolled back"),
            }
            print_list(facade, &facade.list());
        }
        ["rename", id, name @ ..] => {
            let mut updates = FieldUpdates::new();
            updates.insert("name".to_string(), serde_json::Value::from(name.join(" ")));
            let pending = facade.patch(id, updates)?;
            println!("optimistic:");
            print_list(facade, &facade.list());
            match pending.await {
                Some(saved) => println!("renamed {} {} to {}", E::KIND, id, saved.display_name()),
                None => println!("rename failed, rolled back"),
            }
            print_list(facade, &facade.list());
        }
        ["delete", id] => {
            let pending = facade.delete(id)?;
            println!("optimistic:");
            print_list(facade, &facade.list());
            if pending.await {
                println!("deleted {} {}", E::KIND, id);
            } else {
                println!("delete failed, rolled back");
            }
            print_list(facade, &facade.list());
        }
        _ => bail!("unknown {} command\n\n{}", E::KIND, USAGE),
    }
    Ok(())
}

fn print_list<E: Entity, B: Backend<E>>(facade: &EntityFacade<E, B>, entities: &[E]) {
    for entity in entities {
        let marker = if facade.is_pending(entity) { "*" } else { " " };
        println!(
            "{} {:<16} {}",
            marker,
            truncate_string(entity.id(), 16),
            truncate_string(entity.display_name(), NAME_WIDTH)
        );
    }
    println!("({} {})", entities.len(), E::RESOURCE);
}

// ============================================================================
// Demo data
// ============================================================================

async fn demo_console(fail: bool) -> Result<Console<InMemory>> {
    let console = Console::new(&InMemory);
    console.states.backend().seed(vec![
        State::from_draft("1".to_string(), &NewState::named("Arizona")),
        State::from_draft("2".to_string(), &NewState::named("Texas")),
    ]);
    console.cities.backend().seed(vec![
        City {
            id: "1".to_string(),
            name: "Phoenix".to_string(),
            state_id: Some("1".to_string()),
        },
        City {
            id: "2".to_string(),
            name: "Austin".to_string(),
            state_id: Some("2".to_string()),
        },
    ]);
    console.companies.backend().seed(vec![Company {
        id: "1".to_string(),
        name: "Acme Logistics".to_string(),
        email: Some("ops@acme.test".to_string()),
        phone: None,
    }]);
    console.departments.backend().seed(vec![Department {
        id: "1".to_string(),
        name: "Dispatch".to_string(),
        company_id: Some("1".to_string()),
    }]);
    console.skills.backend().seed(vec![Skill {
        id: "1".to_string(),
        name: "Forklift".to_string(),
        description: None,
    }]);
    console.shifts.backend().seed(vec![Shift {
        id: "1".to_string(),
        name: "Morning".to_string(),
        start_time: Some("06:00".to_string()),
        end_time: Some("14:00".to_string()),
    }]);

    console.refresh_all().await?;
    if fail {
        console.states.backend().fail_next(1);
        console.cities.backend().fail_next(1);
        console.companies.backend().fail_next(1);
        console.departments.backend().fail_next(1);
        console.skills.backend().fail_next(1);
        console.shifts.backend().fail_next(1);
    }
    Ok(console)
}
