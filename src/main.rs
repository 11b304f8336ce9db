use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gator::config::Config;
use gator::db::{BrowseQuery, Database, FeedPost, PostSort, StoreError};
use gator::reader::FeedReader;
use gator::scheduler::{Aggregator, AggregatorSettings, Shutdown};

#[derive(Parser, Debug)]
#[command(name = "gator", about = "RSS feed aggregator")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = "gator.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch stale feeds on a fixed interval until interrupted
    Agg {
        /// Delay between ticks, e.g. `30s`, `1m` or `500ms` (bare numbers are seconds)
        #[arg(value_parser = parse_interval)]
        interval: Option<Duration>,
        /// Feeds fetched in parallel per tick
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        concurrency: Option<u32>,
    },
    /// Add a feed owned and followed by the current user
    #[command(name = "addfeed")]
    AddFeed { name: String, url: String },
    /// List all feeds
    Feeds,
    /// Follow an existing feed by url
    Follow { url: String },
    /// List the feeds the current user follows
    Following,
    /// Stop following a feed
    Unfollow { url: String },
    /// Show posts from the feeds the current user follows
    Browse {
        /// Number of posts to show
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(i64).range(1..))]
        limit: i64,
        /// Number of posts to skip
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(i64).range(0..))]
        offset: i64,
        /// published_desc, published, title, title_desc, feed or feed_desc
        #[arg(long, default_value_t = PostSort::PublishedDesc)]
        sort: PostSort,
        /// Only feeds whose name contains this text
        #[arg(long)]
        feed: Option<String>,
    },
}

const DESCRIPTION_WIDTH: usize = 150;

/// Cuts `text` to `width` characters, ending in `...` when shortened.
fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let kept: String = text.chars().take(width.saturating_sub(3)).collect();
    format!("{}...", kept)
}

fn print_posts(posts: &[FeedPost], query: &BrowseQuery) {
    print!(
        "Showing {} posts (offset {}, sorted by {}",
        posts.len(),
        query.offset,
        query.sort
    );
    if let Some(filter) = &query.feed_filter {
        print!(", filtered by feed: {}", filter);
    }
    println!(")\n");

    for (i, FeedPost { post, feed_name }) in posts.iter().enumerate() {
        println!("{}. {}", query.offset + i as i64 + 1, post.title);
        if let Some(description) = post.description.as_deref().filter(|d| !d.is_empty()) {
            println!("   {}", truncate(description, DESCRIPTION_WIDTH));
        }
        println!("   Link: {}", post.url);
        println!("   Feed: {}", feed_name);
        if let Some(published) = post.published_at {
            println!("   Published: {}", published.format("%a, %d %b %Y %H:%M:%S UTC"));
        }
        println!();
    }

    if posts.len() as i64 == query.limit {
        println!(
            "To see more posts, use: gator browse --offset={}",
            query.offset + query.limit
        );
    }
}

fn parse_interval(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid interval '{}'", raw))?;

    let interval = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => return Err(format!("unknown interval unit '{}' (use ms, s, m or h)", unit)),
    };

    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}

fn current_user(config: &Config) -> anyhow::Result<&str> {
    config
        .current_user
        .as_deref()
        .context("current_user is not set in the config file")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::load_or_default(&args.config)?;

    // Initialize database
    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| config.database_url.clone());
    let db = Database::new(&database_url)
        .await
        .with_context(|| format!("Failed to open database '{}'", database_url))?;
    db.initialize().await?;
    let synced = db
        .sync_feeds(&config.feeds, config.current_user.as_deref())
        .await?;
    if synced > 0 {
        info!("Synced {} feeds from configuration", synced);
    }

    match args.command {
        Command::Agg {
            interval,
            concurrency,
        } => {
            let settings = AggregatorSettings {
                interval: interval.unwrap_or_else(|| config.aggregator.interval()),
                concurrency: concurrency
                    .map(|c| c as usize)
                    .unwrap_or(config.aggregator.concurrency),
                fetch_timeout: config.aggregator.fetch_timeout(),
                store_timeout: config.aggregator.store_timeout(),
            };
            let reader = FeedReader::new()?.with_max_body_size(config.aggregator.max_feed_bytes);
            let aggregator = Aggregator::new(Arc::new(db), reader, settings);

            let (trigger, shutdown) = Shutdown::channel();
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("Interrupt received, finishing current tick"),
                    Err(e) => warn!("Failed to listen for interrupt: {}", e),
                }
                trigger.trigger();
            });

            aggregator.run(shutdown).await;
        }
        Command::AddFeed { name, url } => {
            let owner = current_user(&config)?;
            let feed = db
                .add_feed(&name, &url, owner)
                .await
                .with_context(|| format!("Couldn't create feed '{}'", url))?;
            println!("Feed {} created and followed by {}", feed.name, feed.owner);
        }
        Command::Feeds => {
            for feed in db.get_all_feeds().await? {
                println!("* {}", feed.name);
                println!("  URL: {}", feed.url);
                println!("  Owner: {}", feed.owner);
                match feed.last_fetched {
                    Some(at) => println!("  Last fetched: {}", at.format("%Y-%m-%d %H:%M:%S")),
                    None => println!("  Last fetched: never"),
                }
            }
        }
        Command::Follow { url } => {
            let user = current_user(&config)?;
            match db.follow_feed(user, &url).await {
                Ok(feed) => println!("{} is now following {}", user, feed.name),
                Err(e @ StoreError::AlreadyFollowing { .. }) => println!("{}", e),
                Err(e) => return Err(e).context("Couldn't follow feed"),
            }
        }
        Command::Following => {
            let user = current_user(&config)?;
            println!("Feeds followed by {}:", user);
            for feed in db.feeds_followed_by(user).await? {
                println!("* {}", feed.name);
            }
        }
        Command::Unfollow { url } => {
            let user = current_user(&config)?;
            if db.unfollow_feed(user, &url).await? {
                println!("{} unfollowed {}", user, url);
            } else {
                println!("{} was not following {}", user, url);
            }
        }
        Command::Browse {
            limit,
            offset,
            sort,
            feed,
        } => {
            let user = current_user(&config)?;
            let query = BrowseQuery {
                limit,
                offset,
                sort,
                feed_filter: feed,
            };
            let posts = db.posts_for_user(user, &query).await?;
            if posts.is_empty() {
                println!("No posts found. Run `gator agg` to collect some.");
            } else {
                print_posts(&posts, &query);
            }
        }
    }

    Ok(())
}
