use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use thiserror::Error;

use crate::config::FeedConfig;

#[derive(Debug, Clone, FromRow)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub owner: String,
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Post {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A post together with the name of the feed it came from.
#[derive(Debug, Clone, FromRow)]
pub struct FeedPost {
    #[sqlx(flatten)]
    pub post: Post,
    pub feed_name: String,
}

/// Orderings offered by [`Database::posts_for_user`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PostSort {
    #[default]
    PublishedDesc,
    Published,
    Title,
    TitleDesc,
    Feed,
    FeedDesc,
}

impl PostSort {
    const ALL: [PostSort; 6] = [
        PostSort::PublishedDesc,
        PostSort::Published,
        PostSort::Title,
        PostSort::TitleDesc,
        PostSort::Feed,
        PostSort::FeedDesc,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PostSort::PublishedDesc => "published_desc",
            PostSort::Published => "published",
            PostSort::Title => "title",
            PostSort::TitleDesc => "title_desc",
            PostSort::Feed => "feed",
            PostSort::FeedDesc => "feed_desc",
        }
    }

    fn order_by(self) -> &'static str {
        match self {
            PostSort::PublishedDesc => "posts.published_at DESC NULLS LAST, posts.id DESC",
            PostSort::Published => "posts.published_at ASC NULLS LAST, posts.id ASC",
            PostSort::Title => "posts.title ASC, posts.id ASC",
            PostSort::TitleDesc => "posts.title DESC, posts.id DESC",
            PostSort::Feed => "feeds.name ASC, posts.published_at DESC NULLS LAST, posts.id DESC",
            PostSort::FeedDesc => {
                "feeds.name DESC, posts.published_at DESC NULLS LAST, posts.id DESC"
            }
        }
    }
}

impl fmt::Display for PostSort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|sort| sort.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Self::ALL.iter().map(|sort| sort.as_str()).collect();
                format!("invalid sort option '{}', expected one of: {}", s, valid.join(", "))
            })
    }
}

/// Page of posts to show for a user.
#[derive(Debug, Clone)]
pub struct BrowseQuery {
    pub limit: i64,
    pub offset: i64,
    pub sort: PostSort,
    /// Keeps feeds whose name contains this text
    pub feed_filter: Option<String>,
}

impl Default for BrowseQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            sort: PostSort::default(),
            feed_filter: None,
        }
    }
}

/// Parameters for [`Store::insert_post`]. The url is the dedup key.
#[derive(Debug, Clone, Copy)]
pub struct NewPost<'a> {
    pub feed_id: i64,
    pub title: &'a str,
    pub url: &'a str,
    pub description: Option<&'a str>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A post with this url is already stored
    #[error("post already stored: {url}")]
    Duplicate { url: String },
    #[error("feed {0} not found")]
    FeedNotFound(i64),
    #[error("no feed with url {0}")]
    UnknownFeedUrl(String),
    #[error("{user} is already following {url}")]
    AlreadyFollowing { user: String, url: String },
    #[error("storage operation timed out")]
    Timeout,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Storage operations the aggregation engine depends on.
#[async_trait]
pub trait Store: Send + Sync {
    /// Up to `limit` feeds, never-fetched first, then oldest `last_fetched` first.
    async fn select_stale_feeds(&self, limit: usize) -> Result<Vec<Feed>, StoreError>;

    /// Records `now` as the feed's last fetch. Never moves the timestamp backwards.
    async fn mark_feed_fetched(&self, feed_id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the url is already stored.
    async fn insert_post(&self, post: NewPost<'_>) -> Result<Post, StoreError>;
}

/// Fixed-width so that text order matches time order.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Every connection to an in-memory database gets its own empty database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                owner TEXT NOT NULL,
                last_fetched TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                description TEXT,
                published_at TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_follows (
                id INTEGER PRIMARY KEY,
                user_name TEXT NOT NULL,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                UNIQUE(user_name, feed_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_posts_feed_published
            ON posts(feed_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upserts the configured feeds and has each owner follow theirs. Feeds
    /// without an owner go to `default_owner`; if that is also missing the
    /// feed is skipped.
    pub async fn sync_feeds(
        &self,
        configs: &[FeedConfig],
        default_owner: Option<&str>,
    ) -> anyhow::Result<usize> {
        let now = format_timestamp(Utc::now());
        let mut synced = 0;
        for config in configs {
            let Some(owner) = config.owner.as_deref().or(default_owner) else {
                tracing::warn!(feed = %config.url, "Skipping configured feed without an owner");
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO feeds (name, url, owner, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(url) DO UPDATE SET
                    name = excluded.name,
                    owner = excluded.owner
                "#,
            )
            .bind(&config.name)
            .bind(&config.url)
            .bind(owner)
            .bind(&now)
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                INSERT OR IGNORE INTO feed_follows (user_name, feed_id, created_at)
                SELECT ?, id, ? FROM feeds WHERE url = ?
                "#,
            )
            .bind(owner)
            .bind(&now)
            .bind(&config.url)
            .execute(&self.pool)
            .await?;
            synced += 1;
        }
        Ok(synced)
    }

    /// Creates a feed and has its owner follow it.
    pub async fn add_feed(&self, name: &str, url: &str, owner: &str) -> anyhow::Result<Feed> {
        let now = format_timestamp(Utc::now());
        let mut tx = self.pool.begin().await?;
        let feed = sqlx::query_as::<_, Feed>(
            r#"
            INSERT INTO feeds (name, url, owner, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(url)
        .bind(owner)
        .bind(&now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO feed_follows (user_name, feed_id, created_at) VALUES (?, ?, ?)")
            .bind(owner)
            .bind(feed.id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(feed)
    }

    pub async fn get_all_feeds(&self) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>("SELECT * FROM feeds ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(feeds)
    }

    pub async fn get_feed(&self, feed_id: i64) -> anyhow::Result<Option<Feed>> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(feed)
    }

    /// Makes `user` follow the feed at `url`, returning the feed.
    pub async fn follow_feed(&self, user: &str, url: &str) -> Result<Feed, StoreError> {
        let feed = sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::UnknownFeedUrl(url.to_string()))?;

        let followed =
            sqlx::query("INSERT INTO feed_follows (user_name, feed_id, created_at) VALUES (?, ?, ?)")
                .bind(user)
                .bind(feed.id)
                .bind(format_timestamp(Utc::now()))
                .execute(&self.pool)
                .await;

        match followed {
            Ok(_) => Ok(feed),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::AlreadyFollowing {
                    user: user.to_string(),
                    url: url.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns false when `user` was not following the feed.
    pub async fn unfollow_feed(&self, user: &str, url: &str) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM feed_follows
            WHERE user_name = ?
              AND feed_id IN (SELECT id FROM feeds WHERE url = ?)
            "#,
        )
        .bind(user)
        .bind(url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Feeds `user` follows, in the order they were followed.
    pub async fn feeds_followed_by(&self, user: &str) -> anyhow::Result<Vec<Feed>> {
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT feeds.* FROM feeds
            JOIN feed_follows ON feed_follows.feed_id = feeds.id
            WHERE feed_follows.user_name = ?
            ORDER BY feed_follows.id
            "#,
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    /// One page of posts from the feeds `user` follows.
    pub async fn posts_for_user(
        &self,
        user: &str,
        query: &BrowseQuery,
    ) -> anyhow::Result<Vec<FeedPost>> {
        let sql = format!(
            r#"
            SELECT posts.*, feeds.name AS feed_name FROM posts
            JOIN feeds ON feeds.id = posts.feed_id
            JOIN feed_follows ON feed_follows.feed_id = feeds.id
            WHERE feed_follows.user_name = ?1
              AND (?2 IS NULL OR feeds.name LIKE '%' || ?2 || '%')
            ORDER BY {}
            LIMIT ?3 OFFSET ?4
            "#,
            query.sort.order_by()
        );
        let posts = sqlx::query_as::<_, FeedPost>(&sql)
            .bind(user)
            .bind(query.feed_filter.as_deref())
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(posts)
    }

    pub async fn get_post_count_for_feed(&self, feed_id: i64) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM posts WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}

#[async_trait]
impl Store for Database {
    async fn select_stale_feeds(&self, limit: usize) -> Result<Vec<Feed>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let feeds = sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            ORDER BY last_fetched ASC NULLS FIRST, id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    async fn mark_feed_fetched(&self, feed_id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE feeds
            SET last_fetched = CASE
                WHEN last_fetched IS NULL OR last_fetched < ?1 THEN ?1
                ELSE last_fetched
            END
            WHERE id = ?2
            "#,
        )
        .bind(format_timestamp(now))
        .bind(feed_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::FeedNotFound(feed_id));
        }
        Ok(())
    }

    async fn insert_post(&self, post: NewPost<'_>) -> Result<Post, StoreError> {
        let inserted = sqlx::query_as::<_, Post>(
            r#"
            INSERT INTO posts (feed_id, title, url, description, published_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(post.feed_id)
        .bind(post.title)
        .bind(post.url)
        .bind(post.description)
        .bind(post.published_at.map(format_timestamp))
        .bind(format_timestamp(Utc::now()))
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(row),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(StoreError::Duplicate {
                    url: post.url.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
