use anyhow::{Context, Result};
use clap::Subcommand;

use herald::models::UserId;
use herald::storage::{SharedStorage, UserDirectory};

#[derive(Subcommand)]
pub enum UserCommand {
    /// Register a user
    Add {
        #[arg(long)]
        username: String,

        #[arg(long)]
        email: String,
    },

    /// List all users
    List,

    /// Stop a user from receiving broadcasts
    Deactivate {
        #[arg(long)]
        id: i64,
    },
}

pub async fn user(storage: &SharedStorage, action: UserCommand) -> Result<()> {
    match action {
        UserCommand::Add { username, email } => {
            let user = storage
                .users
                .create_user(&username, &email)
                .await
                .context("Failed to create user")?;
            println!("Created user {} ({})", user.id, user.username);
        }

        UserCommand::List => {
            let users = storage.users.list_users().await?;
            if users.is_empty() {
                println!("No users registered.");
                return Ok(());
            }

            println!("{:>6}  {:<20} {:<30} {}", "ID", "USERNAME", "EMAIL", "ACTIVE");
            for user in users {
                println!(
                    "{:>6}  {:<20} {:<30} {}",
                    user.id.0,
                    user.username,
                    user.email,
                    if user.active { "yes" } else { "no" }
                );
            }
        }

        UserCommand::Deactivate { id } => {
            if storage.users.deactivate_user(UserId(id)).await? {
                println!("User {id} deactivated");
            } else {
                println!("User {id} not found or already inactive");
            }
        }
    }

    Ok(())
}
