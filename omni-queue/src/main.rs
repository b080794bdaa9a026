//! omni-queue - Manage publish tasks
//!
//! Operator tool for the inbound side of Omnicast: create tasks, inspect
//! them, cancel or move them, push them to the front of the queue, and feed
//! destination webhooks by hand.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use libomnicast::logging::LogSettings;
use libomnicast::scheduling::parse_schedule;
use libomnicast::service::{CreateTaskRequest, PublishNow, PublishingService};
use libomnicast::types::{DestinationOptions, PostEdit, YoutubeOptions};
use libomnicast::{Config, ContentRefs, Destination, OmnicastError, PublishRecord, PublishTask, TaskFilter, TaskStatus};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "omni-queue")]
#[command(version)]
#[command(about = "Manage publish tasks")]
#[command(long_about = "\
omni-queue - Manage publish tasks

DESCRIPTION:
    omni-queue creates and manages publish tasks in the Omnicast store.
    Tasks due within the immediate threshold are queued on creation; the rest
    are picked up by the omni-send scheduler.

COMMANDS:
    create      Create a publish task
    list        List tasks
    show        Show one task
    cancel      Cancel a task
    reschedule  Move a waiting task to another time
    now         Publish a waiting task as soon as possible
    edit        Edit the text of a published post
    webhook     Apply a destination webhook body
    history     List publish records
    stats       Show queue and task statistics

USAGE EXAMPLES:
    # Publish a video to YouTube in two hours
    omni-queue create --account yt-main --destination youtube \\
        --video https://cdn.example/launch.mp4 --title Launch --at 2h

    # List failed tasks as JSON
    omni-queue list --status fail --format json

    # Move a task to tomorrow afternoon
    omni-queue reschedule <TASK_ID> \"tomorrow 3pm\" --owner user-1

    # Fix the caption of a published Facebook post
    omni-queue edit <TASK_ID> --owner user-1 --description \"Doors open at 10\"

    # Replay a TikTok webhook
    omni-queue webhook tiktok --file event.json

CONFIGURATION:
    Configuration file: ~/.config/omnicast/config.toml (or OMNICAST_CONFIG)

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Authorization or configuration error
    3 - Invalid input (bad task ID, time format, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration file
    #[arg(short, long, global = true, env = "OMNICAST_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a publish task
    Create {
        /// Account to publish with
        #[arg(short, long)]
        account: String,

        /// Destination of the account
        #[arg(short, long)]
        destination: Destination,

        #[arg(long, value_name = "URL")]
        video: Option<String>,

        #[arg(long, value_name = "URL")]
        cover: Option<String>,

        /// Image URL; repeat for several images
        #[arg(long = "image", value_name = "URL")]
        images: Vec<String>,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Topic to add as a hashtag; repeat for several
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// When to publish (e.g., "now", "30m", "tomorrow 3pm", RFC 3339)
        #[arg(long, default_value = "now")]
        at: String,

        /// Destination options as JSON, e.g. '{"tiktok":{"privacy_level":"SELF_ONLY"}}'
        #[arg(long, value_name = "JSON")]
        options: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List tasks
    List {
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        account: Option<String>,

        #[arg(short, long)]
        destination: Option<Destination>,

        #[arg(short, long)]
        status: Option<TaskStatus>,

        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show one task
    Show {
        task_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a task
    Cancel {
        task_id: String,

        /// Owner of the task
        #[arg(long)]
        owner: String,
    },

    /// Move a waiting task to another time
    Reschedule {
        task_id: String,

        /// New time (e.g., "tomorrow 3pm", "2h", RFC 3339)
        time: String,

        /// Owner of the task
        #[arg(long)]
        owner: String,
    },

    /// Publish a waiting task as soon as possible
    Now { task_id: String },

    /// Edit the text and metadata of a published post
    Edit {
        task_id: String,

        /// Owner of the task
        #[arg(long)]
        owner: String,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Replacement topic; repeat for several
        #[arg(long = "topic")]
        topics: Vec<String>,

        /// New YouTube status options as JSON, e.g. '{"privacy_status":"unlisted"}'
        #[arg(long, value_name = "JSON")]
        youtube: Option<String>,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Apply a destination webhook body (read from --file or stdin)
    Webhook {
        destination: Destination,

        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },

    /// List publish records
    History {
        #[arg(long)]
        owner: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show queue and task statistics
    Stats {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Quiet by default: stdout is for results
    LogSettings::quiet().verbose(cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<OmnicastError>() {
        Some(OmnicastError::Config(_)) => 2,
        Some(e) => e.exit_code(),
        None => 1,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    let service = PublishingService::from_config(config).await?;

    match cli.command {
        Commands::Create {
            account,
            destination,
            video,
            cover,
            images,
            title,
            description,
            topics,
            at,
            options,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let options: DestinationOptions = match options {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| OmnicastError::InvalidInput(format!("invalid --options: {}", e)))?,
                None => DestinationOptions::default(),
            };
            let request = CreateTaskRequest {
                account_id: account,
                destination,
                content: ContentRefs {
                    video_url: video,
                    cover_url: cover,
                    image_urls: images,
                    title,
                    description,
                    topics,
                },
                scheduled_at: parse_schedule(&at)?.timestamp(),
                options,
            };
            let task = service.create_publish_task(request).await?;
            match format {
                OutputFormat::Json => print_json(&task)?,
                OutputFormat::Text => println!("{}", task.id),
            }
        }
        Commands::List {
            owner,
            account,
            destination,
            status,
            limit,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let filter = TaskFilter {
                owner_id: owner,
                account_id: account,
                status,
                destination,
                limit,
            };
            let tasks = service.list_tasks(&filter).await?;
            match format {
                OutputFormat::Json => print_json(&tasks)?,
                OutputFormat::Text => {
                    let now = chrono::Utc::now().timestamp();
                    for task in &tasks {
                        println!("{}", task_line(task, now));
                    }
                }
            }
        }
        Commands::Show { task_id, format } => {
            let format = OutputFormat::parse(&format)?;
            let task = service
                .get_task(&task_id)
                .await?
                .ok_or_else(|| OmnicastError::NotFound(format!("task {}", task_id)))?;
            match format {
                OutputFormat::Json => print_json(&task)?,
                OutputFormat::Text => print_task(&task),
            }
        }
        Commands::Cancel { task_id, owner } => {
            if !service.cancel_task(&task_id, &owner).await? {
                return Err(OmnicastError::NotFound(format!("task {} for owner {}", task_id, owner)).into());
            }
            println!("Cancelled {}", task_id);
        }
        Commands::Reschedule { task_id, time, owner } => {
            let at = parse_schedule(&time)?;
            if !service.reschedule_task(&task_id, at.timestamp(), &owner).await? {
                return Err(OmnicastError::NotFound(format!("task {} for owner {}", task_id, owner)).into());
            }
            println!("Rescheduled {} to {}", task_id, at.to_rfc3339());
        }
        Commands::Now { task_id } => {
            match service.publish_now(&task_id).await? {
                PublishNow::Promoted => println!("Promoted {}", task_id),
                PublishNow::Enqueued => println!("Queued {}", task_id),
            }
        }
        Commands::Edit {
            task_id,
            owner,
            title,
            description,
            topics,
            youtube,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let youtube: Option<YoutubeOptions> = match youtube {
                Some(json) => Some(
                    serde_json::from_str(&json)
                        .map_err(|e| OmnicastError::InvalidInput(format!("invalid --youtube: {}", e)))?,
                ),
                None => None,
            };
            let edit = PostEdit {
                title,
                description,
                topics: (!topics.is_empty()).then_some(topics),
                youtube,
            };
            let stored = service.update_published_post(&task_id, &owner, edit).await?;
            match format {
                OutputFormat::Json => print_json(&stored)?,
                OutputFormat::Text => println!("Edit of {} {}", stored.task_id, stored.status),
            }
        }
        Commands::Webhook { destination, file } => {
            let body = match file {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                None => {
                    let mut body = String::new();
                    std::io::stdin().read_to_string(&mut body).context("reading stdin")?;
                    body
                }
            };
            match service.handle_webhook(destination, &body).await? {
                Some(record) => println!("{} {}", record.task_id, record.status.as_str()),
                None => println!("ignored"),
            }
        }
        Commands::History { owner, limit, format } => {
            let format = OutputFormat::parse(&format)?;
            let records = service.list_records(owner.as_deref(), limit).await?;
            match format {
                OutputFormat::Json => print_json(&records)?,
                OutputFormat::Text => {
                    for record in &records {
                        println!("{}", record_line(record));
                    }
                }
            }
        }
        Commands::Stats { format } => {
            let format = OutputFormat::parse(&format)?;
            let stats = service.stats().await?;
            match format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Text => {
                    let queues = [
                        ("publish", &stats.publish_queue),
                        ("media", &stats.media_queue),
                        ("update", &stats.update_queue),
                    ];
                    for (name, queue) in queues {
                        println!(
                            "{} queue: {} waiting, {} delayed, {} active, {} failed",
                            name, queue.waiting, queue.delayed, queue.active, queue.failed
                        );
                    }
                    for (status, count) in &stats.tasks {
                        println!("tasks {}: {}", status, count);
                    }
                }
            }
        }
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => bail!(OmnicastError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn task_line(task: &PublishTask, now: i64) -> String {
    format!(
        "{} | {} | {} | {} | {}",
        task.id,
        task.destination,
        task.status,
        format_time_until(now, task.scheduled_at),
        truncate_content(&task.content.post_message(), 40)
    )
}

fn print_task(task: &PublishTask) {
    println!("id:          {}", task.id);
    println!("owner:       {}", task.owner_id);
    println!("account:     {}", task.account_id);
    println!("destination: {}", task.destination);
    println!("status:      {}", task.status);
    println!("scheduled:   {}", format_timestamp(task.scheduled_at));
    println!("job:         {}", task.queue_job_id);
    if let Some(video) = &task.content.video_url {
        println!("video:       {}", video);
    }
    for image in &task.content.image_urls {
        println!("image:       {}", image);
    }
    if let Some(content_id) = &task.destination_content_id {
        println!("content id:  {}", content_id);
    }
    if let Some(error) = &task.error_message {
        println!("error:       {}", error);
    }
}

fn record_line(record: &PublishRecord) -> String {
    format!(
        "{} | {} | {} | {} | {}",
        record.task_id,
        record.destination,
        record.status.as_str(),
        format_timestamp(record.published_at),
        record.permalink.as_deref().unwrap_or(&record.destination_content_id)
    )
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Truncate to `max_chars` characters with an ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        format!("{}...", flat.chars().take(max_chars).collect::<String>())
    }
}

fn format_time_until(now: i64, scheduled_at: i64) -> String {
    let diff = scheduled_at - now;
    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_until() {
        assert_eq!(format_time_until(100, 50), "overdue");
        assert_eq!(format_time_until(0, 30), "in <1 minute");
        assert_eq!(format_time_until(0, 120), "in 2 minutes");
        assert_eq!(format_time_until(0, 3600), "in 1 hour");
        assert_eq!(format_time_until(0, 3 * 86_400), "in 3 days");
    }

    #[test]
    fn test_truncate_content_counts_characters() {
        assert_eq!(truncate_content("short", 10), "short");
        assert_eq!(truncate_content("héllo wörld", 5), "héllo...");
        assert_eq!(truncate_content("two\nlines", 20), "two lines");
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!(OutputFormat::parse("json").unwrap(), OutputFormat::Json);
        let err = OutputFormat::parse("xml").unwrap_err();
        assert!(matches!(err.downcast_ref::<OmnicastError>(), Some(OmnicastError::InvalidInput(_))));
    }
}
