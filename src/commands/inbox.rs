use anyhow::Result;

use herald::models::UserId;
use herald::storage::{BroadcastStore, NotificationReader, SharedStorage};
use herald::utils::truncate_text;

pub async fn inbox(storage: &SharedStorage, user: i64, page: u32, per_page: u32) -> Result<()> {
    let listing = storage
        .reader
        .list_for_recipient(UserId(user), page, per_page)
        .await?;

    if listing.items.is_empty() {
        println!("Inbox is empty.");
        return Ok(());
    }

    for notification in &listing.items {
        let title = match storage.broadcasts.get(notification.broadcast_id).await? {
            Some(broadcast) => truncate_text(&broadcast.title, 50),
            None => String::from("(deleted)"),
        };
        println!(
            "{:>6}  {} {}  {}",
            notification.id,
            if notification.read { " " } else { "*" },
            notification.delivered_at.format("%Y-%m-%d %H:%M"),
            title
        );
    }
    println!(
        "\nPage {}/{} ({} total)",
        listing.page,
        listing.pages(),
        listing.total
    );

    Ok(())
}

pub async fn read(storage: &SharedStorage, notification: i64, user: i64) -> Result<()> {
    if storage.reader.mark_read(notification, UserId(user)).await? {
        println!("Notification {notification} marked as read");
    } else {
        println!("Notification {notification} unchanged (missing, not yours, or already read)");
    }
    Ok(())
}
