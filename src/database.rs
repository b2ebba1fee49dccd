use crate::model::{Listing, ListingFilter, ListingStatus, ListingUpdate, NewListing, Reservation};
use crate::store::{new_listing_id, ListingStore};
use crate::{MarketError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const CAS_ATTEMPTS: usize = 5;

const LISTING_COLUMNS: &str = "id, title, description, price, currency, condition, category, status, \
     seller, holder, locked, reserved_at, version, created_at, updated_at";

/// SQLite-backed [`ListingStore`]. Status changes are conditional updates on
/// the `version` column, so concurrent writers across processes stay safe.
pub struct SqliteListingStore {
    pool: SqlitePool,
}

impl SqliteListingStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_options(database_url, 5, Duration::from_secs(5)).await
    }

    pub async fn with_options(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);

        // Every connection to `:memory:` is its own database.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                price TEXT NOT NULL,
                currency TEXT NOT NULL,
                condition TEXT NOT NULL,
                category TEXT NOT NULL,
                status TEXT NOT NULL,
                seller TEXT NOT NULL,
                holder TEXT,
                locked INTEGER NOT NULL DEFAULT 0,
                reserved_at DATETIME,
                version INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_listings_status ON listings(status);
            CREATE INDEX IF NOT EXISTS idx_listings_category ON listings(category);
            CREATE INDEX IF NOT EXISTS idx_listings_seller ON listings(seller);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<Listing> {
        let row = sqlx::query(&format!("SELECT {} FROM listings WHERE id = ?", LISTING_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => listing_from_row(&row),
            None => Err(MarketError::ListingNotFound(id.to_string())),
        }
    }

    async fn insert(&self, listing: &Listing) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO listings (id, title, description, price, currency, condition, category, status,
                                  seller, holder, locked, reserved_at, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&listing.id)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.price.to_string())
        .bind(&listing.currency)
        .bind(&listing.condition)
        .bind(&listing.category)
        .bind(listing.status.as_str())
        .bind(&listing.seller)
        .bind(listing.reservation.as_ref().map(|r| r.holder.clone()))
        .bind(listing.reservation.as_ref().map_or(false, |r| r.locked))
        .bind(listing.reservation.as_ref().map(|r| r.reserved_at))
        .bind(listing.version as i64)
        .bind(listing.created_at)
        .bind(listing.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn compare_and_set(&self, next: &Listing, expected_version: u64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET title = ?, description = ?, price = ?, condition = ?, category = ?, status = ?,
                holder = ?, locked = ?, reserved_at = ?, version = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&next.title)
        .bind(&next.description)
        .bind(next.price.to_string())
        .bind(&next.condition)
        .bind(&next.category)
        .bind(next.status.as_str())
        .bind(next.reservation.as_ref().map(|r| r.holder.clone()))
        .bind(next.reservation.as_ref().map_or(false, |r| r.locked))
        .bind(next.reservation.as_ref().map(|r| r.reserved_at))
        .bind(next.version as i64)
        .bind(next.updated_at)
        .bind(&next.id)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Read, apply the transition, conditionally write. A lost race re-reads
    /// and re-applies, so the transition rules see the winner's state.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Listing>
    where
        F: Fn(&mut Listing) -> Result<()> + Send + Sync,
    {
        for attempt in 1..=CAS_ATTEMPTS {
            let current = self.fetch(id).await?;
            let mut next = current.clone();
            f(&mut next)?;
            if next == current {
                return Ok(next);
            }
            if self.compare_and_set(&next, current.version).await? {
                debug!(listing_id = id, status = %next.status, version = next.version, "listing updated");
                return Ok(next);
            }
            debug!(listing_id = id, attempt, "version conflict, re-reading listing");
        }
        warn!(listing_id = id, "listing write kept losing version races");
        Err(MarketError::concurrent_reservation(id))
    }
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing> {
    let price: String = row.try_get("price")?;
    let status: String = row.try_get("status")?;
    let holder: Option<String> = row.try_get("holder")?;
    let locked: bool = row.try_get("locked")?;
    let reserved_at: Option<DateTime<Utc>> = row.try_get("reserved_at")?;
    let version: i64 = row.try_get("version")?;

    let reservation = match (holder, reserved_at) {
        (Some(holder), Some(reserved_at)) => Some(Reservation {
            holder,
            locked,
            reserved_at,
        }),
        _ => None,
    };

    Ok(Listing {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        price: Decimal::from_str(&price)?,
        currency: row.try_get("currency")?,
        condition: row.try_get("condition")?,
        category: row.try_get("category")?,
        status: ListingStatus::from_str(&status)?,
        seller: row.try_get("seller")?,
        reservation,
        version: version as u64,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn create(&self, draft: NewListing) -> Result<Listing> {
        self.create_with_id(&new_listing_id(), draft).await
    }

    async fn create_with_id(&self, id: &str, draft: NewListing) -> Result<Listing> {
        draft.validate()?;
        let listing = Listing::from_draft(id.to_string(), draft.clone());
        if self.insert(&listing).await? {
            return Ok(listing);
        }
        let existing = self.fetch(id).await?;
        if existing.same_fields(&draft) {
            Ok(existing)
        } else {
            Err(MarketError::ListingConflict(id.to_string()))
        }
    }

    async fn get(&self, id: &str) -> Result<Listing> {
        self.fetch(id).await
    }

    async fn update(&self, id: &str, update: ListingUpdate) -> Result<Listing> {
        self.mutate(id, |l| l.apply_update(update.clone())).await
    }

    async fn list(&self, filter: &ListingFilter) -> Result<Vec<Listing>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM listings
            WHERE (?1 IS NULL OR status = ?1)
              AND (?2 IS NULL OR category = ?2 COLLATE NOCASE)
              AND (?3 IS NULL OR seller = ?3)
            ORDER BY created_at, id
            "#,
            LISTING_COLUMNS
        ))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.category.as_deref())
        .bind(filter.seller.as_deref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(listing_from_row).collect()
    }

    async fn publish(&self, id: &str) -> Result<Listing> {
        self.mutate(id, |l| l.publish()).await
    }

    async fn reserve(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.reserve(holder)).await
    }

    async fn lock_for_settlement(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.lock_for_settlement(holder)).await
    }

    async fn release(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.release(holder)).await
    }

    async fn mark_sold(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.mark_sold(holder)).await
    }

    async fn cancel(&self, id: &str) -> Result<Listing> {
        self.mutate(id, |l| l.cancel()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn draft() -> NewListing {
        NewListing {
            title: "Gaming Laptop".to_string(),
            description: "RTX 4080, 32GB RAM".to_string(),
            price: dec!(1500.00),
            currency: "USD".to_string(),
            condition: "used".to_string(),
            category: "electronics".to_string(),
            seller: "seller-1".to_string(),
        }
    }

    async fn file_store(dir: &TempDir) -> SqliteListingStore {
        let url = format!("sqlite://{}", dir.path().join("listings.db").display());
        SqliteListingStore::new(&url).await.unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_preserves_listing() {
        let store = SqliteListingStore::new("sqlite::memory:").await.unwrap();
        let created = store.create_with_id("laptop-001", draft()).await.unwrap();
        store.publish("laptop-001").await.unwrap();
        let reserved = store.reserve("laptop-001", "buyer-1").await.unwrap();

        let fetched = store.get("laptop-001").await.unwrap();
        assert_eq!(fetched.price, dec!(1500.00));
        assert_eq!(fetched.status, ListingStatus::Reserved);
        assert_eq!(fetched.reserved_by(), Some("buyer-1"));
        assert_eq!(fetched.version, reserved.version);
        assert!(fetched.version > created.version);
    }

    #[tokio::test]
    async fn test_create_with_id_conflict() {
        let store = SqliteListingStore::new("sqlite::memory:").await.unwrap();
        store.create_with_id("laptop-001", draft()).await.unwrap();
        assert!(store.create_with_id("laptop-001", draft()).await.is_ok());

        let mut changed = draft();
        changed.title = "Other".to_string();
        assert!(matches!(
            store.create_with_id("laptop-001", changed).await,
            Err(MarketError::ListingConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_terminal_states_reject_changes() {
        let store = SqliteListingStore::new("sqlite::memory:").await.unwrap();
        store.create_with_id("x", draft()).await.unwrap();
        store.publish("x").await.unwrap();
        store.cancel("x").await.unwrap();
        assert!(matches!(
            store.reserve("x", "buyer").await,
            Err(MarketError::InvalidTransition { .. })
        ));
        assert!(store.publish("x").await.is_err());
    }

    #[tokio::test]
    async fn test_list_filter_matches_memory_store() {
        let store = SqliteListingStore::new("sqlite::memory:").await.unwrap();
        store.create_with_id("a", draft()).await.unwrap();
        store.create_with_id("b", draft()).await.unwrap();
        store.publish("a").await.unwrap();

        let active = store
            .list(&ListingFilter {
                status: Some(ListingStatus::Active),
                category: Some("ELECTRONICS".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
        assert_eq!(store.list(&ListingFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserve_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(file_store(&dir).await);
        store.create_with_id("laptop-001", draft()).await.unwrap();
        store.publish("laptop-001").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.reserve("laptop-001", &format!("buyer-{}", i)).await
            }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            if let Ok(listing) = handle.await.unwrap() {
                winners.push(listing.reserved_by().map(str::to_string));
            }
        }
        assert_eq!(winners.len(), 1);
        let stored = store.get("laptop-001").await.unwrap();
        assert_eq!(stored.reserved_by().map(str::to_string), winners[0]);
    }
}
