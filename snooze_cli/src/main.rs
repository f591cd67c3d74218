use chrono::{Duration, FixedOffset};
use clap::{Parser, Subcommand, ValueEnum};
use snooze_core::events::Response;
use snooze_core::summary::{
    chunk_blocks, format_duration, render_row, render_rows, summary_row, FIELD_CHAR_LIMIT,
};
use snooze_core::*;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "snooze")]
#[command(about = "Sleep tracker for chat communities", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Treat this RFC 3339 timestamp as the current time
    #[arg(long, global = true)]
    at: Option<String>,

    /// User running the command, for admin overrides
    #[arg(long, global = true)]
    actor: Option<String>,

    /// Log debug output to stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a sleep session
    Sleep { user: String },

    /// End the current sleep session
    Wake { user: String },

    /// Show one user's status, or everyone's
    Status { user: Option<String> },

    /// Override a user's status (admins only)
    Set {
        user: String,
        /// "sleep" or "wake"
        status: String,
    },

    /// Delete all sleep data for a user
    Clear {
        user: String,
        /// Skip the confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Report a presence change from the chat platform
    Presence { user: String, state: PresenceState },

    /// Read commands from stdin, keeping confirmations between them
    Shell,
}

#[derive(Clone, Copy, ValueEnum)]
enum PresenceState {
    Online,
    Offline,
}

struct Context {
    config: Config,
    zone: FixedOffset,
    at: Option<Timestamp>,
    actor: Option<String>,
}

impl Context {
    fn now(&self) -> Timestamp {
        self.at.unwrap_or_else(|| now_in(&self.zone))
    }

    fn engine(&self) -> Reconciler<JsonLedgerStore> {
        Reconciler::new(JsonLedgerStore::new(self.config.ledger_path(), self.zone))
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    snooze_core::logging::init_with_level(if cli.verbose { "debug" } else { "warn" });

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            match e {
                Error::StorageCorruption { .. } => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(dir) = cli.data_dir {
        config.data.data_dir = dir;
    }
    let zone = config.zone()?;
    let at = cli
        .at
        .as_deref()
        .map(|s| parse_timestamp(s, &zone))
        .transpose()?;

    let ctx = Context {
        config,
        zone,
        at,
        actor: cli.actor,
    };
    tracing::debug!("Using ledger at {:?}", ctx.config.ledger_path());

    match cli.command {
        Commands::Sleep { user } => cmd_sleep(&ctx, &user),
        Commands::Wake { user } => cmd_wake(&ctx, &user),
        Commands::Status { user } => cmd_status(&ctx, user.as_deref()),
        Commands::Set { user, status } => cmd_set(&ctx, &user, &status),
        Commands::Clear { user, yes } => cmd_clear(&ctx, &user, yes),
        Commands::Presence { user, state } => cmd_presence(&ctx, &user, state),
        Commands::Shell => cmd_shell(&ctx),
    }
}

fn cmd_sleep(ctx: &Context, user: &str) -> Result<()> {
    let engine = ctx.engine();
    let transition = engine.begin_sleep(user, ctx.now())?;
    print_transition(&transition);
    print_summary(&engine, ctx.now())
}

fn cmd_wake(ctx: &Context, user: &str) -> Result<()> {
    let engine = ctx.engine();
    let transition = engine.end_sleep(user, ctx.now())?;
    print_transition(&transition);
    print_summary(&engine, ctx.now())
}

fn cmd_status(ctx: &Context, user: Option<&str>) -> Result<()> {
    let engine = ctx.engine();
    match user {
        Some(user) => {
            let resolution = engine.resolve_status(user, ctx.now())?;
            print_resolution(user, &resolution, ctx.now());
            Ok(())
        }
        None => print_summary(&engine, ctx.now()),
    }
}

fn cmd_set(ctx: &Context, user: &str, status: &str) -> Result<()> {
    let actor_id = ctx.actor.clone().unwrap_or_default();
    let actor = Actor::new(actor_id.as_str(), ctx.config.is_admin(&actor_id));
    let transition = ctx.engine().set_status(user, status, ctx.now(), &actor)?;

    let state = match transition.kind {
        TransitionKind::FellAsleep => "sleeping",
        TransitionKind::WokeUp { .. } => "awake",
    };
    println!("✓ Set {} to {}", user, state);
    Ok(())
}

fn cmd_clear(ctx: &Context, user: &str, yes: bool) -> Result<()> {
    if let Some(actor) = ctx.actor.as_deref() {
        if actor != user && !ctx.config.is_admin(actor) {
            return Err(Error::Forbidden {
                actor_id: actor.to_string(),
            });
        }
    }

    if !yes {
        println!("⚠ This deletes ALL sleep data for {}.", user);
        println!("  Re-run with --yes to confirm, or press clear twice in `snooze shell`.");
        return Ok(());
    }

    print_clear(user, &ctx.engine().clear_user_data(user)?);
    Ok(())
}

fn cmd_presence(ctx: &Context, user: &str, state: PresenceState) -> Result<()> {
    let went_offline = matches!(state, PresenceState::Offline);
    let report = ctx
        .engine()
        .on_presence_change(user, went_offline, ctx.now())?;
    print_presence(user, &report);
    Ok(())
}

// ============================================================================
// Shell
// ============================================================================

const SHELL_HELP: &str = "\
Commands:
  sleep <user>              start sleeping
  wake <user>               stop sleeping
  status [<user>]           show status
  set <user> <sleep|wake>   admin override (as --actor)
  clear <user>              press twice within the window to delete data
  online <user>             presence came back
  offline <user>            presence went away
  wait <seconds>            advance the clock (with --at only)
  help                      show this text
  quit                      leave the shell";

fn cmd_shell(ctx: &Context) -> Result<()> {
    let mut tracker = Tracker::new(
        ctx.engine(),
        ctx.config.access.admins.clone(),
        &ctx.config.ui,
    );
    let mut clock = ctx.at;
    let now = |clock: &Option<Timestamp>| clock.unwrap_or_else(|| now_in(&ctx.zone));

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("snooze> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            continue;
        };

        let at = now(&clock);
        for message in tracker.due_deletions(at) {
            tracing::debug!("Deleting transient message {}", message.message_id);
        }

        let own = |kind: ActionKind, user: &str| UserAction::own(kind, user, at);
        let action = match (command, args) {
            ("quit" | "exit", _) => break,
            ("help", _) => {
                println!("{}", SHELL_HELP);
                continue;
            }
            ("wait", [secs]) => {
                match (clock.as_mut(), secs.parse::<i64>()) {
                    (Some(t), Ok(secs)) => {
                        match Duration::try_seconds(secs).and_then(|d| t.checked_add_signed(d)) {
                            Some(later) => *t = later,
                            None => println!("Error: cannot wait {} seconds", secs),
                        }
                    }
                    (None, _) => println!("wait only works with --at"),
                    (_, Err(_)) => println!("wait needs a number of seconds"),
                }
                continue;
            }
            ("status", []) => {
                if let Err(e) = print_summary(tracker.engine(), at) {
                    println!("Error: {}", e);
                }
                continue;
            }
            ("online" | "offline", [user]) => {
                let event = PresenceEvent {
                    user_id: user.to_string(),
                    went_offline: command == "offline",
                    now: at,
                };
                match tracker.handle_presence(&event) {
                    Ok(report) => print_presence(*user, &report),
                    Err(e) => println!("Error: {}", e),
                }
                continue;
            }
            ("sleep", [user]) => own(ActionKind::BeginSleep, *user),
            ("wake", [user]) => own(ActionKind::EndSleep, *user),
            ("status", [user]) => own(ActionKind::Query, *user),
            ("clear", [user]) => own(ActionKind::ClearData, *user),
            ("set", [user, status]) => UserAction {
                kind: ActionKind::AdminSet {
                    status: status.to_string(),
                },
                user_id: user.to_string(),
                actor_id: ctx.actor.clone().unwrap_or_default(),
                now: at,
            },
            _ => {
                println!("Unknown command {:?}. Type `help` for a list.", line.trim());
                continue;
            }
        };

        let response = tracker.handle_action(&action);
        print_response(&action, &response, &ctx.config);
    }

    Ok(())
}

fn print_response(action: &UserAction, response: &Response, config: &Config) {
    for message in &response.retracted {
        tracing::debug!("Retracting message {}", message.message_id);
    }

    match &response.result {
        TransitionResult::Success(ActionOutcome::Transition(t)) => print_transition(t),
        TransitionResult::Success(ActionOutcome::Status(r)) => {
            print_resolution(&action.user_id, r, action.now)
        }
        TransitionResult::Success(ActionOutcome::ClearPending) => {
            println!(
                "⚠ This deletes ALL sleep data for {}. Run `clear {}` again within {}s to confirm.",
                action.user_id, action.user_id, config.ui.clear_confirm_secs
            );
        }
        TransitionResult::Success(ActionOutcome::Cleared(outcome)) => {
            print_clear(&action.user_id, outcome)
        }
        TransitionResult::Conflict(e) | TransitionResult::Error(e) => println!("Error: {}", e),
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_correction(correction: &Correction) {
    match correction {
        Correction::AnomalousSleep { record } => println!(
            "⚠ Asleep for over 150 hours, so the session was closed automatically after {}.",
            format_duration(Duration::minutes(record.duration_minutes))
        ),
        Correction::AnomalousAwake { .. } => {
            println!("⚠ Awake for over 200 hours, so the last wake time was reset.")
        }
    }
}

fn print_transition(transition: &Transition) {
    transition.corrections.iter().for_each(print_correction);

    match &transition.kind {
        TransitionKind::FellAsleep => println!(
            "😴 Good night, {}! Sleep started at {}",
            transition.user_id,
            transition.at.format("%Y-%m-%d %H:%M")
        ),
        TransitionKind::WokeUp { record } => {
            println!(
                "🌅 Good morning, {}! You slept {}",
                transition.user_id,
                format_duration(Duration::minutes(record.duration_minutes))
            );
            println!("  Went to bed: {}", record.sleep_start.format("%Y-%m-%d %H:%M"));
            println!("  Woke up: {}", record.sleep_end.format("%Y-%m-%d %H:%M"));
        }
    }
}

fn print_resolution(user: &str, resolution: &Resolution, now: Timestamp) {
    resolution.corrections.iter().for_each(print_correction);

    match &resolution.status {
        ResolvedStatus::NeverTracked => println!("{} has no sleep records.", user),
        ResolvedStatus::Tracked(status) => {
            let member = Member::new(user, user, Presence::Offline);
            println!("{}", render_row(&summary_row(&member, status, now)));
        }
    }
}

fn print_summary<S: LedgerStore>(engine: &Reconciler<S>, now: Timestamp) -> Result<()> {
    let members: Vec<Member> = engine
        .store()
        .load()?
        .iter()
        .map(|(id, _)| Member::new(id, id, Presence::Offline))
        .collect();

    let rows = build_summary(engine, &members, now)?;
    println!();
    println!("📊 Status ({})", now.format("%Y-%m-%d %H:%M"));
    if rows.is_empty() {
        println!("No one has any sleep records yet. Run `snooze sleep <user>` to start.");
        return Ok(());
    }

    let chunks = chunk_blocks(&render_rows(&rows), FIELD_CHAR_LIMIT);
    let total = chunks.len();
    for (i, chunk) in chunks.iter().enumerate() {
        if total > 1 {
            println!("── Members ({}/{}) ──", i + 1, total);
        }
        println!("{}", chunk);
    }
    Ok(())
}

fn print_clear(user: &str, outcome: &ClearOutcome) {
    match outcome {
        ClearOutcome::Cleared => println!("✓ All sleep data for {} was cleared.", user),
        ClearOutcome::NoData => println!("ℹ No sleep data to clear for {}.", user),
    }
}

fn print_presence(user: &str, report: &PresenceReport) {
    report.corrections.iter().for_each(print_correction);

    match &report.outcome {
        PresenceOutcome::Untracked => println!("{} is not tracked; ignoring presence.", user),
        PresenceOutcome::AutoSlept => println!("😴 {} went offline and is now sleeping.", user),
        PresenceOutcome::AutoWoke { record } => println!(
            "🌅 {} came back online and woke up after {}.",
            user,
            format_duration(Duration::minutes(record.duration_minutes))
        ),
        PresenceOutcome::Unchanged => println!("{}'s status is unchanged.", user),
    }
}
