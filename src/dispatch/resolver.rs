//! Recipient resolution
//!
//! Turns an owner and an optional explicit target list into the ordered,
//! deduplicated set of recipients to notify, plus the ids that had to be
//! dropped because they are unknown or inactive.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::models::UserId;
use crate::storage::UserDirectory;
use crate::utils::unique_sorted;

/// Output of one resolution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Recipients to deliver to, ascending
    pub recipients: Vec<UserId>,
    /// Explicit targets that do not exist or are inactive, ascending
    pub unknown: Vec<UserId>,
}

impl Resolution {
    /// Size of the target set, dropped ids included
    pub fn total(&self) -> usize {
        self.recipients.len() + self.unknown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Resolves target sets against the user directory
pub struct RecipientResolver {
    users: Arc<dyn UserDirectory>,
    exclude_owner_from_explicit: bool,
}

impl RecipientResolver {
    pub fn new(users: Arc<dyn UserDirectory>, exclude_owner_from_explicit: bool) -> Self {
        Self {
            users,
            exclude_owner_from_explicit,
        }
    }

    /// Resolve the target set of a broadcast owned by `owner`.
    ///
    /// An empty `explicit` list means every active user except the owner.
    /// Otherwise each id is checked against the directory; unknown ids end up
    /// in [`Resolution::unknown`] instead of aborting the resolution.
    pub async fn resolve(&self, owner: UserId, explicit: &[UserId]) -> Result<Resolution> {
        if explicit.is_empty() {
            let recipients = unique_sorted(
                self.users
                    .active_user_ids()
                    .await?
                    .into_iter()
                    .filter(|id| *id != owner),
            );
            debug!(owner = %owner, recipients = recipients.len(), "Resolved all active users");
            return Ok(Resolution {
                recipients,
                unknown: Vec::new(),
            });
        }

        let mut requested = unique_sorted(explicit.iter().copied());
        if self.exclude_owner_from_explicit {
            requested.retain(|id| *id != owner);
        }

        let known = self.users.known_user_ids(&requested).await?;
        let (recipients, unknown): (Vec<UserId>, Vec<UserId>) =
            requested.into_iter().partition(|id| known.contains(id));

        if !unknown.is_empty() {
            debug!(owner = %owner, unknown = ?unknown, "Dropping unknown target ids");
        }

        Ok(Resolution {
            recipients,
            unknown,
        })
    }
}
