use anyhow::{bail, Context, Result};
use clap::Subcommand;

use herald::models::{BroadcastFilter, BroadcastId, BroadcastStatus, BroadcastUpdate, UserId};
use herald::storage::{BroadcastStore, NotificationReader, SharedStorage};
use herald::utils::truncate_text;

#[derive(Subcommand)]
pub enum BroadcastCommand {
    /// Create a draft
    Create {
        #[arg(long)]
        owner: i64,

        #[arg(long)]
        title: String,

        #[arg(long)]
        body: String,
    },

    /// List an owner's broadcasts, newest first
    List {
        #[arg(long)]
        owner: i64,

        /// Only show this status (draft, sending, sent, failed)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "10")]
        per_page: u32,
    },

    /// Show one broadcast and its deliveries
    Show {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        owner: i64,
    },

    /// Edit a draft
    Update {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        owner: i64,

        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        body: Option<String>,
    },

    /// Delete a draft
    Delete {
        #[arg(long)]
        id: i64,

        #[arg(long)]
        owner: i64,
    },
}

pub async fn broadcast(storage: &SharedStorage, action: BroadcastCommand) -> Result<()> {
    match action {
        BroadcastCommand::Create { owner, title, body } => {
            let draft = storage
                .broadcasts
                .create_draft(UserId(owner), &title, &body)
                .await
                .context("Failed to create draft")?;
            println!("Created draft {} \"{}\"", draft.id, draft.title);
        }

        BroadcastCommand::List {
            owner,
            status,
            page,
            per_page,
        } => {
            let mut filter = BroadcastFilter::new(page, per_page);
            if let Some(status) = status {
                let Some(status) = BroadcastStatus::parse(&status) else {
                    bail!("Unknown status: {status}");
                };
                filter = filter.with_status(status);
            }

            let listing = storage.broadcasts.list_by_owner(UserId(owner), &filter).await?;
            if listing.items.is_empty() {
                println!("No broadcasts found.");
                return Ok(());
            }

            for item in &listing.items {
                println!(
                    "{:>6}  {:<8} {}  {}",
                    item.id.0,
                    item.status.as_str(),
                    item.created_at.format("%Y-%m-%d %H:%M"),
                    truncate_text(&item.title, 50)
                );
            }
            println!(
                "\nPage {}/{} ({} total)",
                listing.page,
                listing.pages(),
                listing.total
            );
        }

        BroadcastCommand::Show { id, owner } => {
            let item = storage
                .broadcasts
                .get_owned(BroadcastId(id), UserId(owner))
                .await?;
            let deliveries = storage.reader.list_for_broadcast(item.id).await?;
            let read = deliveries.iter().filter(|n| n.read).count();

            println!("Broadcast {}", item.id);
            println!("  Title: {}", item.title);
            println!("  Status: {}", item.status);
            println!("  Created: {}", item.created_at.to_rfc3339());
            if let Some(sent_at) = item.sent_at {
                println!("  Sent: {}", sent_at.to_rfc3339());
            }
            println!("  Deliveries: {} ({} read)", deliveries.len(), read);
            println!("\n{}", item.body);
        }

        BroadcastCommand::Update {
            id,
            owner,
            title,
            body,
        } => {
            let update = BroadcastUpdate { title, body };
            if update.is_empty() {
                bail!("Nothing to update: pass --title and/or --body");
            }
            let item = storage
                .broadcasts
                .update_draft(BroadcastId(id), UserId(owner), &update)
                .await?;
            println!("Updated draft {} \"{}\"", item.id, item.title);
        }

        BroadcastCommand::Delete { id, owner } => {
            storage
                .broadcasts
                .delete_draft(BroadcastId(id), UserId(owner))
                .await?;
            println!("Deleted draft {id}");
        }
    }

    Ok(())
}
