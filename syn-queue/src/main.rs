//! syn-queue - Manage scheduled content
//!
//! Unix-style tool for scheduling content and inspecting the dispatch
//! queue.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use libsyndicate::config::Config;
use libsyndicate::db::ContentStore;
use libsyndicate::queue::Queue;
use libsyndicate::scheduler::{local_to_utc, Scheduler};
use libsyndicate::types::ContentItem;
use libsyndicate::{Result, SyndicateError};

#[derive(Parser, Debug)]
#[command(name = "syn-queue")]
#[command(version)]
#[command(about = "Manage scheduled content")]
#[command(long_about = "\
syn-queue - Manage scheduled content

DESCRIPTION:
    syn-queue is a Unix-style tool for managing the Syndicate schedule.
    Use it to schedule content, list or cancel upcoming items, move them
    to a different time, trigger immediate posting, ask for optimal
    posting times, and inspect queue statistics.

COMMANDS:
    schedule    Schedule content for future posting
    list        List scheduled content
    cancel      Cancel a scheduled item
    reschedule  Move a scheduled item to a different time
    now         Enqueue an item for immediate posting
    suggest     Suggest optimal posting times for a platform
    stats       Show queue and schedule statistics

USAGE EXAMPLES:
    # Schedule at a fixed local time
    syn-queue schedule \"Release is out!\" --team acme \\
        --platforms mastodon,twitter --at 2025-03-10T09:00 --timezone UTC

    # Schedule at the next recommended slot for a platform
    syn-queue schedule \"Release is out!\" --team acme \\
        --platforms twitter --optimal-date 2025-03-10 --timezone UTC

    # List upcoming items in JSON
    syn-queue list --team acme --format json

    # Cancel, move, or fire immediately
    syn-queue cancel <CONTENT_ID>
    syn-queue reschedule <CONTENT_ID> 2025-03-11T15:00 --timezone UTC
    syn-queue now <CONTENT_ID>

    # Ranked posting times from engagement history
    syn-queue suggest twitter --team acme

    # Queue counts by state
    syn-queue stats --team acme

CONFIGURATION:
    Configuration file: ~/.config/syndicate/config.toml
    Database location: ~/.local/share/syndicate/syndicate.db

    Override with environment variables:
        SYNDICATE_CONFIG - Path to config file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Database or configuration error
    3 - Invalid input (bad id, time format, state)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schedule content for future posting
    Schedule {
        /// The content body to post
        content: String,

        /// Team the content belongs to
        #[arg(long, default_value = "default")]
        team: String,

        /// Comma-separated target platforms
        #[arg(long, value_delimiter = ',', required = true)]
        platforms: Vec<String>,

        /// Fixed local time (e.g. 2025-03-10T09:00)
        #[arg(long, conflicts_with = "optimal_date")]
        at: Option<String>,

        /// Pick the next recommended slot on this date (YYYY-MM-DD)
        #[arg(long)]
        optimal_date: Option<String>,

        /// IANA timezone the times are interpreted in
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// List scheduled content
    List {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Filter by team
        #[arg(long)]
        team: Option<String>,
    },

    /// Cancel a scheduled item (returns it to draft)
    Cancel {
        /// Content ID to cancel
        content_id: String,
    },

    /// Move a scheduled item to a different time
    Reschedule {
        /// Content ID to reschedule
        content_id: String,

        /// New local time (e.g. 2025-03-11T15:00)
        time: String,

        /// IANA timezone the time is interpreted in
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// Enqueue an item for immediate posting
    Now {
        /// Content ID to post now
        content_id: String,

        /// Queue priority (higher dispatches first)
        #[arg(long, default_value_t = 10)]
        priority: i64,
    },

    /// Suggest optimal posting times for a platform
    Suggest {
        /// Platform to suggest times for
        platform: String,

        /// Team whose engagement history to use
        #[arg(long, default_value = "default")]
        team: String,

        /// IANA timezone for the suggested hours
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },

    /// Show queue and schedule statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Team for schedule counts
        #[arg(long, default_value = "default")]
        team: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "error" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let store = ContentStore::new(&config.database.path).await?;
    let queue = Queue::new(store.pool().clone(), config.queue.lease_timeout_secs);
    let scheduler = Scheduler::new(store.clone(), queue.clone());

    match cli.command {
        Commands::Schedule {
            content,
            team,
            platforms,
            at,
            optimal_date,
            timezone,
        } => {
            cmd_schedule(
                &scheduler, content, team, platforms, at, optimal_date, &timezone,
            )
            .await?;
        }
        Commands::List { format, team } => {
            cmd_list(&store, &format, team.as_deref()).await?;
        }
        Commands::Cancel { content_id } => {
            scheduler.cancel(&content_id).await?;
            println!("Cancelled {}", content_id);
        }
        Commands::Reschedule {
            content_id,
            time,
            timezone,
        } => {
            let when = local_to_utc(parse_datetime(&time)?, &timezone)?;
            scheduler.reschedule(&content_id, when).await?;
            println!("Rescheduled {} to {}", content_id, when.to_rfc3339());
        }
        Commands::Now {
            content_id,
            priority,
        } => {
            let job_id = scheduler.enqueue_immediate(&content_id, priority).await?;
            println!("Enqueued {} (job {})", content_id, job_id);
        }
        Commands::Suggest {
            platform,
            team,
            timezone,
        } => {
            cmd_suggest(&scheduler, &team, &platform, &timezone).await?;
        }
        Commands::Stats { format, team } => {
            cmd_stats(&queue, &scheduler, &format, &team).await?;
        }
    }

    Ok(())
}

async fn cmd_schedule(
    scheduler: &Scheduler,
    content: String,
    team: String,
    platforms: Vec<String>,
    at: Option<String>,
    optimal_date: Option<String>,
    timezone: &str,
) -> Result<()> {
    let draft = ContentItem::draft(team.clone(), content).with_platforms(platforms.clone());

    let item = match (at, optimal_date) {
        (Some(at), None) => {
            let when = local_to_utc(parse_datetime(&at)?, timezone)?;

            let conflicts = scheduler
                .check_conflicts(&team, when, &platforms, None)
                .await?;
            for conflict in &conflicts {
                eprintln!(
                    "Warning: conflicts with {} at {} on {}",
                    conflict.content_id,
                    format_instant(conflict.scheduled_at),
                    conflict.overlapping_platforms.join(", ")
                );
            }

            scheduler.schedule_at(draft, when).await?
        }
        (None, Some(date)) => {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
                SyndicateError::InvalidTime(format!("invalid date '{}', expected YYYY-MM-DD", date))
            })?;
            let platform = platforms.first().cloned().unwrap_or_default();
            scheduler
                .schedule_optimal(draft, date, timezone, &platform)
                .await?
        }
        _ => {
            return Err(SyndicateError::Validation(
                "exactly one of --at or --optimal-date is required".to_string(),
            ))
        }
    };

    let scheduled_at = item.scheduled_at.unwrap_or_default();
    println!("Scheduled {} for {}", item.id, format_instant(scheduled_at));
    Ok(())
}

async fn cmd_list(store: &ContentStore, format: &str, team: Option<&str>) -> Result<()> {
    validate_format(format)?;
    let items = store.list_scheduled(team).await?;

    if format == "json" {
        let json: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "id": item.id,
                    "team_id": item.team_id,
                    "content": item.content,
                    "platforms": item.target_platforms,
                    "status": item.status.as_str(),
                    "scheduled_at": item.scheduled_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&json).unwrap());
        return Ok(());
    }

    let now = Utc::now().timestamp();
    for item in &items {
        let when = item
            .scheduled_at
            .map(|ts| format!("{} ({})", format_instant(ts), format_time_until(now, ts)))
            .unwrap_or_else(|| "unscheduled".to_string());

        println!(
            "{} | {} | {} | {}",
            item.id,
            truncate(&item.content, 50),
            item.target_platforms.join(","),
            when
        );
    }

    Ok(())
}

async fn cmd_suggest(
    scheduler: &Scheduler,
    team: &str,
    platform: &str,
    timezone: &str,
) -> Result<()> {
    let suggestions = scheduler
        .suggest_optimal_times(team, platform, timezone)
        .await?;

    const WEEKDAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for s in suggestions {
        let day = s
            .weekday
            .and_then(|d| WEEKDAYS.get(d as usize))
            .copied()
            .unwrap_or("any day");
        let basis = match s.mean_engagement {
            Some(mean) => format!("mean engagement {:.1} over {} posts", mean, s.samples),
            None => "platform default".to_string(),
        };
        println!(
            "{:02}:{:02} {} [{}] - {}",
            s.hour, s.minute, day, s.confidence, basis
        );
    }

    Ok(())
}

async fn cmd_stats(queue: &Queue, scheduler: &Scheduler, format: &str, team: &str) -> Result<()> {
    validate_format(format)?;
    let queue_stats = queue.stats().await?;
    let schedule_stats = scheduler.schedule_stats(team).await?;

    if format == "json" {
        let json = serde_json::json!({
            "queue": {
                "waiting": queue_stats.waiting,
                "delayed": queue_stats.delayed,
                "leased": queue_stats.leased,
                "completed": queue_stats.completed,
                "failed": queue_stats.failed,
            },
            "schedule": {
                "draft": schedule_stats.draft,
                "scheduled": schedule_stats.scheduled,
                "queued": schedule_stats.queued,
                "dispatching": schedule_stats.dispatching,
                "posted": schedule_stats.posted,
                "failed": schedule_stats.failed,
                "next_scheduled_at": schedule_stats.next_scheduled_at,
            },
        });
        println!("{}", serde_json::to_string_pretty(&json).unwrap());
        return Ok(());
    }

    println!("Queue:");
    println!("  waiting:   {}", queue_stats.waiting);
    println!("  delayed:   {}", queue_stats.delayed);
    println!("  leased:    {}", queue_stats.leased);
    println!("  completed: {}", queue_stats.completed);
    println!("  failed:    {}", queue_stats.failed);
    println!("Schedule ({}):", team);
    println!("  draft:       {}", schedule_stats.draft);
    println!("  scheduled:   {}", schedule_stats.scheduled);
    println!("  queued:      {}", schedule_stats.queued);
    println!("  dispatching: {}", schedule_stats.dispatching);
    println!("  posted:      {}", schedule_stats.posted);
    println!("  failed:      {}", schedule_stats.failed);
    if let Some(next) = schedule_stats.next_scheduled_at {
        println!("  next:        {}", format_instant(next));
    }

    Ok(())
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(SyndicateError::Validation(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

/// Accepts `YYYY-MM-DDTHH:MM[:SS]` (a space also works as the separator).
fn parse_datetime(input: &str) -> Result<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(parsed);
        }
    }
    Err(SyndicateError::InvalidTime(format!(
        "invalid time '{}', expected YYYY-MM-DDTHH:MM[:SS]",
        input
    )))
}

fn format_instant(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

fn format_time_until(now: i64, ts: i64) -> String {
    if ts <= now {
        return "due".to_string();
    }
    let duration = std::time::Duration::from_secs((ts - now) as u64);
    format!("in {}", humantime::format_duration(duration))
}

fn truncate(content: &str, max_len: usize) -> String {
    if content.chars().count() <= max_len {
        content.to_string()
    } else {
        let cut: String = content.chars().take(max_len).collect();
        format!("{}...", cut)
    }
}
