use crate::model::{Listing, ListingFilter, ListingStatus, ListingUpdate, NewListing};
use crate::{ListingId, MarketError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn create(&self, draft: NewListing) -> Result<Listing>;

    /// Idempotent create. Re-creating with identical fields returns the stored
    /// listing; different fields fail with [`MarketError::ListingConflict`].
    async fn create_with_id(&self, id: &str, draft: NewListing) -> Result<Listing>;

    async fn get(&self, id: &str) -> Result<Listing>;

    async fn update(&self, id: &str, update: ListingUpdate) -> Result<Listing>;

    async fn list(&self, filter: &ListingFilter) -> Result<Vec<Listing>>;

    async fn publish(&self, id: &str) -> Result<Listing>;

    async fn reserve(&self, id: &str, holder: &str) -> Result<Listing>;

    async fn lock_for_settlement(&self, id: &str, holder: &str) -> Result<Listing>;

    async fn release(&self, id: &str, holder: &str) -> Result<Listing>;

    async fn mark_sold(&self, id: &str, holder: &str) -> Result<Listing>;

    async fn cancel(&self, id: &str) -> Result<Listing>;

    /// Reserved listings, locked or not, whose reservation predates `cutoff`.
    async fn stale_reservations(&self, cutoff: DateTime<Utc>) -> Result<Vec<Listing>> {
        let reserved = self
            .list(&ListingFilter {
                status: Some(ListingStatus::Reserved),
                ..Default::default()
            })
            .await?;
        Ok(reserved
            .into_iter()
            .filter(|l| {
                l.reservation
                    .as_ref()
                    .map_or(false, |r| r.reserved_at < cutoff)
            })
            .collect())
    }
}

pub fn new_listing_id() -> ListingId {
    format!("lst-{}", Uuid::new_v4().simple())
}

#[derive(Default)]
pub struct InMemoryListingStore {
    listings: RwLock<HashMap<ListingId, Listing>>,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<Listing>
    where
        F: FnOnce(&mut Listing) -> Result<()>,
    {
        let mut listings = self.listings.write();
        let current = listings
            .get(id)
            .ok_or_else(|| MarketError::ListingNotFound(id.to_string()))?;
        // Work on a copy so a failed transition leaves the stored row untouched.
        let mut next = current.clone();
        f(&mut next)?;
        if next != *current {
            debug!(listing_id = id, status = %next.status, version = next.version, "listing updated");
            listings.insert(id.to_string(), next.clone());
        }
        Ok(next)
    }
}

#[async_trait]
impl ListingStore for InMemoryListingStore {
    async fn create(&self, draft: NewListing) -> Result<Listing> {
        self.create_with_id(&new_listing_id(), draft).await
    }

    async fn create_with_id(&self, id: &str, draft: NewListing) -> Result<Listing> {
        draft.validate()?;
        let mut listings = self.listings.write();
        if let Some(existing) = listings.get(id) {
            if existing.same_fields(&draft) {
                return Ok(existing.clone());
            }
            return Err(MarketError::ListingConflict(id.to_string()));
        }
        let listing = Listing::from_draft(id.to_string(), draft);
        listings.insert(id.to_string(), listing.clone());
        Ok(listing)
    }

    async fn get(&self, id: &str) -> Result<Listing> {
        self.listings
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| MarketError::ListingNotFound(id.to_string()))
    }

    async fn update(&self, id: &str, update: ListingUpdate) -> Result<Listing> {
        self.mutate(id, |l| l.apply_update(update))
    }

    async fn list(&self, filter: &ListingFilter) -> Result<Vec<Listing>> {
        let mut listings: Vec<Listing> = self
            .listings
            .read()
            .values()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect();
        listings.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(listings)
    }

    async fn publish(&self, id: &str) -> Result<Listing> {
        self.mutate(id, |l| l.publish())
    }

    async fn reserve(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.reserve(holder))
    }

    async fn lock_for_settlement(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.lock_for_settlement(holder))
    }

    async fn release(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.release(holder))
    }

    async fn mark_sold(&self, id: &str, holder: &str) -> Result<Listing> {
        self.mutate(id, |l| l.mark_sold(holder))
    }

    async fn cancel(&self, id: &str) -> Result<Listing> {
        self.mutate(id, |l| l.cancel())
    }
}
