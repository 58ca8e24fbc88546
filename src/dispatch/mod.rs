//! Broadcast dispatch and notification fan-out
//!
//! A dispatch moves one broadcast out of `draft`, resolves its recipients,
//! writes one notification per recipient with bounded parallelism, and
//! finalizes the broadcast as `sent` or `failed`.
//!
//! # Flow
//!
//! ```text
//! send(id, caller, targets)
//!   ├─ try_begin_send ──► lease            (single-flight point)
//!   ├─ resolve ─────────► recipients + unknown ids
//!   ├─ fan-out ─────────► deliver × N      (≤ max_concurrent_deliveries, retried)
//!   ├─ finalize(lease) ─► sent | failed
//!   └─ SendResult
//! ```
//!
//! Cancellation (a `watch` channel flipping to `true`) stops new deliveries;
//! in-flight ones run to completion. When the deadline passes, everything not
//! yet completed is counted as failed. Either way the broadcast is finalized.

pub mod error;
pub mod resolver;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use error::{DispatchError, DispatchResult, WriteError};
pub use resolver::{RecipientResolver, Resolution};

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::models::{
    BroadcastId, BroadcastStatus, DispatchOutcome, LeaseToken, SendResult, UserId,
};
use crate::storage::{BroadcastStore, DeliveryStatus, NotificationWriter, SharedStorage};
use crate::utils::retry::{with_retry, RetryConfig};

/// A request to send one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    pub broadcast_id: BroadcastId,
    pub caller_id: UserId,
    /// Empty means every active user except the owner
    pub explicit_targets: Vec<UserId>,
}

impl SendRequest {
    pub fn new(broadcast_id: BroadcastId, caller_id: UserId) -> Self {
        Self {
            broadcast_id,
            caller_id,
            explicit_targets: Vec::new(),
        }
    }

    pub fn with_targets(mut self, targets: impl IntoIterator<Item = UserId>) -> Self {
        self.explicit_targets = targets.into_iter().collect();
        self
    }
}

/// Deadline and cancellation for one dispatch
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl DispatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(deadline_after(timeout))
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Stop starting deliveries once the channel holds `true`
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Roughly 30 years; used when a timeout does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating to a far-future deadline on overflow
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Resolves once the cancellation channel holds `true`; never without a channel
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone: cancellation can no longer happen
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

/// Per-dispatch aggregation
#[derive(Debug, Default)]
struct Tally {
    delivered: usize,
    already_delivered: usize,
    failed: BTreeSet<UserId>,
}

impl Tally {
    fn record(&mut self, recipient: UserId, result: std::result::Result<DeliveryStatus, WriteError>) {
        match result {
            Ok(DeliveryStatus::Delivered) => self.delivered += 1,
            Ok(DeliveryStatus::AlreadyDelivered) => self.already_delivered += 1,
            Err(e) => {
                debug!(recipient = %recipient, error = %e, "Delivery failed after retries");
                self.failed.insert(recipient);
            }
        }
    }

    fn sent(&self) -> usize {
        self.delivered + self.already_delivered
    }

    fn outcome(&self) -> DispatchOutcome {
        DispatchOutcome::new(self.sent(), self.failed.len())
    }
}

/// Orchestrates single-flight dispatch of broadcasts
pub struct Dispatcher {
    broadcasts: Arc<dyn BroadcastStore>,
    writer: Arc<dyn NotificationWriter>,
    resolver: RecipientResolver,
    retry: RetryConfig,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(storage: &SharedStorage, config: DispatchConfig) -> Self {
        Self {
            broadcasts: storage.broadcasts.clone(),
            writer: storage.writer.clone(),
            resolver: RecipientResolver::new(
                storage.users.clone(),
                config.exclude_owner_from_explicit,
            ),
            retry: config.retry_config(),
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Send with the configured default deadline and no cancellation
    pub async fn send(&self, request: SendRequest) -> Result<SendResult> {
        self.send_with_context(request, DispatchContext::new()).await
    }

    /// Send a broadcast.
    ///
    /// Fails with `NotFound`, `Forbidden` or `InvalidState` before any
    /// delivery is attempted. Once the lease is held, partial delivery failure
    /// is reported through the returned counts, not as an error.
    pub async fn send_with_context(
        &self,
        request: SendRequest,
        context: DispatchContext,
    ) -> Result<SendResult> {
        let _timer = metrics::start_dispatch_timer();
        let id = request.broadcast_id;
        let deadline = context
            .deadline
            .unwrap_or_else(|| deadline_after(self.config.default_timeout()));

        let lease = match self.broadcasts.try_begin_send(id, request.caller_id).await {
            Ok(lease) => lease,
            Err(e) => {
                debug!(broadcast_id = %id, caller = %request.caller_id, error = %e, "Send rejected");
                metrics::record_dispatch("rejected");
                return Err(e);
            }
        };
        info!(broadcast_id = %id, caller = %request.caller_id, "Dispatch started");

        let resolution = match self
            .resolver
            .resolve(request.caller_id, &request.explicit_targets)
            .await
        {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(broadcast_id = %id, error = %e, "Recipient resolution failed");
                // Do not leave the broadcast in sending
                let outcome = DispatchOutcome::new(0, request.explicit_targets.len().max(1));
                if let Err(finalize_err) = self.broadcasts.finalize(id, lease, outcome).await {
                    error!(broadcast_id = %id, error = %finalize_err, "Finalize after resolution failure failed");
                }
                metrics::record_dispatch(BroadcastStatus::Failed.as_str());
                return Err(e);
            }
        };

        let mut tally = Tally::default();
        tally.failed.extend(resolution.unknown.iter().copied());

        if resolution.recipients.is_empty() {
            debug!(broadcast_id = %id, unknown = resolution.unknown.len(), "No deliverable recipients");
        } else {
            self.fan_out(id, &resolution.recipients, deadline, context.cancel, &mut tally)
                .await;
        }

        metrics::record_deliveries(
            tally.delivered,
            tally.already_delivered,
            tally.failed.len() - resolution.unknown.len(),
        );

        let status = self.finalize(id, lease, tally.outcome()).await?;
        let result = SendResult {
            broadcast_id: id,
            sent_count: tally.sent(),
            failed_count: tally.failed.len(),
            failed_recipient_ids: tally.failed.into_iter().collect(),
        };

        info!(
            broadcast_id = %id,
            status = %status,
            sent = result.sent_count,
            failed = result.failed_count,
            "Dispatch finished"
        );
        Ok(result)
    }

    /// Fail broadcasts whose lease is older than `dispatch.lease_ttl_secs`
    pub async fn reap_stale(&self) -> Result<Vec<BroadcastId>> {
        self.reap_older_than(self.config.lease_ttl()).await
    }

    /// Fail broadcasts stuck in `sending` for longer than `older_than`
    pub async fn reap_older_than(&self, older_than: Duration) -> Result<Vec<BroadcastId>> {
        let expired = self.broadcasts.expire_stale_leases(older_than).await?;
        if !expired.is_empty() {
            warn!(count = expired.len(), ids = ?expired, "Failed broadcasts with stale leases");
        }
        metrics::record_reaped(expired.len());
        Ok(expired)
    }

    /// Deliver to every recipient, at most `max_concurrent_deliveries` at once
    async fn fan_out(
        &self,
        id: BroadcastId,
        recipients: &[UserId],
        deadline: Instant,
        mut cancel: Option<watch::Receiver<bool>>,
        tally: &mut Tally,
    ) {
        let limit = self.config.max_concurrent_deliveries.max(1);
        let mut pending = recipients.iter().copied();
        let mut outstanding: BTreeSet<UserId> = BTreeSet::new();
        let mut in_flight = FuturesUnordered::new();
        let mut stopped = cancel.as_ref().is_some_and(|rx| *rx.borrow());

        let expiry = tokio::time::sleep_until(deadline);
        tokio::pin!(expiry);

        debug!(broadcast_id = %id, recipients = recipients.len(), limit, "Fan-out started");

        loop {
            while !stopped && in_flight.len() < limit {
                let Some(recipient) = pending.next() else {
                    break;
                };
                outstanding.insert(recipient);
                in_flight.push(self.deliver_with_retry(id, recipient));
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some((recipient, result)) = in_flight.next() => {
                    outstanding.remove(&recipient);
                    tally.record(recipient, result);
                }
                _ = &mut expiry => {
                    warn!(
                        broadcast_id = %id,
                        unfinished = outstanding.len() + pending.len(),
                        "Dispatch deadline reached"
                    );
                    break;
                }
                _ = cancelled(&mut cancel), if !stopped => {
                    info!(
                        broadcast_id = %id,
                        in_flight = in_flight.len(),
                        not_started = pending.len(),
                        "Dispatch cancelled, draining in-flight deliveries"
                    );
                    stopped = true;
                }
            }
        }

        // Unfinished deliveries are dropped; they and everyone never started count as failed
        drop(in_flight);
        tally.failed.extend(outstanding);
        tally.failed.extend(pending);
    }

    async fn deliver_with_retry(
        &self,
        id: BroadcastId,
        recipient: UserId,
    ) -> (UserId, std::result::Result<DeliveryStatus, WriteError>) {
        let result = with_retry(&self.retry, |attempt| {
            if attempt > 0 {
                metrics::record_retry();
                debug!(broadcast_id = %id, recipient = %recipient, attempt, "Retrying delivery");
            }
            self.writer.deliver(id, recipient)
        })
        .await;
        (recipient, result)
    }

    async fn finalize(
        &self,
        id: BroadcastId,
        lease: LeaseToken,
        outcome: DispatchOutcome,
    ) -> Result<BroadcastStatus> {
        match self.broadcasts.finalize(id, lease, outcome).await {
            Ok(status) => {
                metrics::record_dispatch(status.as_str());
                Ok(status)
            }
            Err(Error::Dispatch(DispatchError::StaleLease { .. })) => {
                // Someone else (the reaper) already settled this broadcast
                warn!(broadcast_id = %id, lease = %lease, "Finalize skipped: lease is stale");
                metrics::record_stale_lease();
                metrics::record_dispatch("stale");
                Ok(self.stored_status(id).await)
            }
            Err(e) => {
                error!(broadcast_id = %id, error = %e, "Finalize failed");
                Err(e)
            }
        }
    }

    /// Status as currently persisted; the reaper only ever writes `failed`
    async fn stored_status(&self, id: BroadcastId) -> BroadcastStatus {
        match self.broadcasts.get(id).await {
            Ok(Some(broadcast)) => broadcast.status,
            Ok(None) => BroadcastStatus::Failed,
            Err(e) => {
                warn!(broadcast_id = %id, error = %e, "Could not re-read broadcast after stale lease");
                BroadcastStatus::Failed
            }
        }
    }
}
