//! Operator corrections for stored totals.

use anyhow::{bail, Context, Result};
use tracing::info;

use super::MeterClient;
use crate::model::clock::now_micros;
use crate::model::{Event, OperationId};

/// One correction applied to every listed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Adjustment {
    pub buckets: Vec<String>,
    pub accounts: Vec<String>,
    pub users: Vec<String>,
    /// Added to numberOfObjects.
    pub object_delta: i64,
    /// Added to storageUtilized.
    pub size_delta: i64,
}

impl Adjustment {
    pub fn validate(&self) -> Result<()> {
        if self.object_delta == 0 && self.size_delta == 0 {
            bail!("at least one of the object or storage adjustments is required");
        }
        if self.buckets.is_empty() && self.accounts.is_empty() && self.users.is_empty() {
            bail!("at least one bucket, account or user is required");
        }
        Ok(())
    }

    /// One event per target resource, all stamped at `timestamp`.
    ///
    /// Each event names a single resource, so a bucket correction does not
    /// also move its account's totals.
    pub fn events(&self, timestamp: i64) -> Vec<Event> {
        let mut events =
            Vec::with_capacity(self.buckets.len() + self.accounts.len() + self.users.len());
        for bucket in &self.buckets {
            let mut e = self.event(timestamp);
            e.bucket = Some(bucket.clone());
            events.push(e);
        }
        for account in &self.accounts {
            let mut e = self.event(timestamp);
            e.account = Some(account.clone());
            events.push(e);
        }
        for user in &self.users {
            let mut e = self.event(timestamp);
            e.user = Some(user.clone());
            events.push(e);
        }
        events
    }

    fn event(&self, timestamp: i64) -> Event {
        let mut e = Event::new(OperationId::ManualAdjustment);
        e.timestamp = timestamp;
        e.object_delta = Some(self.object_delta);
        e.size_delta = Some(self.size_delta);
        e
    }
}

/// Push `adjustment` one event at a time, stopping at the first failure.
///
/// The client should have its retry cache disabled so a failed correction
/// is reported to the operator instead of being retried in the background.
pub async fn push_adjustment(client: &MeterClient, adjustment: &Adjustment) -> Result<usize> {
    adjustment.validate()?;

    let events = adjustment.events(now_micros());
    let total = events.len();
    for (i, event) in events.into_iter().enumerate() {
        info!(
            bucket = event.bucket.as_deref(),
            account = event.account.as_deref(),
            user = event.user.as_deref(),
            object_delta = adjustment.object_delta,
            size_delta = adjustment.size_delta,
            "pushing adjustment metric",
        );
        client
            .push_metric(event)
            .await
            .with_context(|| format!("pushing adjustment {} of {total}", i + 1))?;
    }

    info!(adjustments = total, "adjustments written");
    Ok(total)
}
