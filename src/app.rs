use crate::cli::{Cli, Command};
use crate::compose::{self, OutgoingMessage, SendOutcome};
use crate::config::AppDefaults;
use crate::detail;
use crate::errors::AppError;
use crate::gmail::GmailClient;
use crate::oauth::{TokenManager, TokenRecord};
use crate::onboarding::{self, TokenStore};
use crate::sync::Mailbox;
use crate::types::{MessageDetail, MessageSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

const RENDER_WIDTH: usize = 100;

pub async fn run(cli: Cli) -> Result<()> {
    let mut defaults = AppDefaults::load()?;
    if let Some(account) = cli.account {
        defaults.account = account;
    }
    let store = TokenStore::for_account(&defaults.account);

    match cli.command {
        Command::Login => {
            let record = onboarding::sign_in(&defaults).await?;
            store.save(&record)?;
            println!("Signed in ({}).", defaults.account);
        }
        Command::Logout => {
            onboarding::sign_out(&store)?;
            println!("Signed out ({}).", defaults.account);
        }
        Command::Compose { to, subject, body } => {
            let message = OutgoingMessage { to, subject, body };
            match compose::submit(&message)? {
                SendOutcome::NotImplemented => println!("Sending is not available yet."),
            }
        }
        Command::List => {
            let session = Session::open(&defaults, store).await?;
            let mut mailbox = session.mailbox(&defaults);
            let loaded = mailbox.load_initial().await.map(|_| ());
            session.persist(mailbox.token());
            loaded.map_err(with_reauth_hint)?;
            print_summaries(mailbox.messages());
        }
        Command::Sync => {
            let session = Session::open(&defaults, store).await?;
            let mut mailbox = session.mailbox(&defaults);
            let result = match mailbox.load_initial().await {
                Ok(_) => mailbox.drain().await,
                Err(err) => Err(err),
            };
            session.persist(mailbox.token());
            if let Err(err) = result {
                // Whatever arrived before the failure is still worth showing.
                warn!(error = %err, fetched = mailbox.messages().len(), "Sync stopped early");
                print_summaries(mailbox.messages());
                return Err(with_reauth_hint(err));
            }
            print_summaries(mailbox.messages());
            info!(total = mailbox.cursor().total_fetched, "Sync finished");
        }
        Command::Show { id, raw } => {
            let session = Session::open(&defaults, store).await?;
            let message = detail::get_detail(&session.client, &session.token, &id)
                .await
                .map_err(with_reauth_hint)?;
            if message.is_unread {
                if let Err(err) =
                    detail::mark_read_state(&session.client, &session.token, &id, true).await
                {
                    warn!(message_id = %id, error = %err, "Could not mark message read");
                }
            }
            print_detail(&message, raw)?;
        }
        Command::MarkRead { id } => {
            let session = Session::open(&defaults, store).await?;
            detail::mark_read_state(&session.client, &session.token, &id, true)
                .await
                .map_err(with_reauth_hint)?;
            println!("Marked {id} read.");
        }
        Command::MarkUnread { id } => {
            let session = Session::open(&defaults, store).await?;
            detail::mark_read_state(&session.client, &session.token, &id, false)
                .await
                .map_err(with_reauth_hint)?;
            println!("Marked {id} unread.");
        }
        Command::Download {
            message_id,
            attachment_id,
            out,
        } => {
            let session = Session::open(&defaults, store).await?;
            let bytes =
                detail::download_attachment(&session.client, &session.token, &message_id, &attachment_id)
                    .await
                    .map_err(with_reauth_hint)?;
            let path = out.unwrap_or_else(|| PathBuf::from(&attachment_id));
            std::fs::write(&path, &bytes)
                .with_context(|| format!("writing attachment to {}", path.display()))?;
            println!("Saved {} bytes to {}", bytes.len(), path.display());
        }
    }

    Ok(())
}

/// A signed-in account with a token that was valid when the command started.
struct Session {
    client: GmailClient,
    tokens: TokenManager,
    token: TokenRecord,
    store: TokenStore,
}

impl Session {
    async fn open(defaults: &AppDefaults, store: TokenStore) -> Result<Self> {
        let stored = store
            .load()?
            .context("not signed in; run `postbox login` first")?;
        let tokens = TokenManager::from_defaults(defaults)?;
        let client = GmailClient::from_defaults(defaults)?;

        let token = tokens
            .get_valid_token(&stored)
            .await
            .map_err(|e| with_reauth_hint(e.into()))?;
        if token != stored {
            if let Err(err) = store.save(&token) {
                warn!(error = %err, "Could not persist refreshed token");
            }
        }
        token
            .bearer()
            .map_err(|e| with_reauth_hint(e.into()))?;

        Ok(Self {
            client,
            tokens,
            token,
            store,
        })
    }

    fn mailbox(&self, defaults: &AppDefaults) -> Mailbox {
        Mailbox::new(
            self.client.clone(),
            self.tokens.clone(),
            defaults.policy.clone(),
            self.token.clone(),
        )
    }

    /// Save a token the mailbox refreshed during the run.
    fn persist(&self, latest: &TokenRecord) {
        if *latest == self.token {
            return;
        }
        if let Err(err) = self.store.save(latest) {
            warn!(error = %err, "Could not persist refreshed token");
        }
    }
}

fn with_reauth_hint(err: AppError) -> anyhow::Error {
    if err.requires_reauth() {
        anyhow::Error::new(err).context("session is no longer valid; run `postbox login`")
    } else {
        err.into()
    }
}

fn print_summaries(messages: &[MessageSummary]) {
    println!("\n{}", "=".repeat(80));
    println!("Inbox ({} messages)", messages.len());
    println!("{}\n", "=".repeat(80));

    for (i, msg) in messages.iter().enumerate() {
        let status = if msg.is_unread { "U" } else { "R" };
        println!("{}. [{}] [{}] {}", i + 1, status, msg.date, msg.subject);
        println!("   From: {}", msg.from);
        println!("   Id: {}", msg.id);
        if !msg.snippet.is_empty() {
            println!("   Preview: {}", truncate(&msg.snippet, 100));
        }
        println!();
    }
}

fn print_detail(message: &MessageDetail, raw: bool) -> Result<()> {
    let received = message
        .internal_date
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string());

    println!("Subject: {}", message.subject);
    println!("From:    {}", message.from);
    if !message.to.is_empty() {
        println!("To:      {}", message.to);
    }
    if !message.cc.is_empty() {
        println!("Cc:      {}", message.cc);
    }
    println!("Date:    {}", received.as_deref().unwrap_or(&message.date));
    println!("{}", "-".repeat(80));

    if message.is_html && !raw {
        let text = html2text::from_read(message.body.as_bytes(), RENDER_WIDTH)
            .map_err(|e| anyhow::anyhow!("rendering HTML body: {e}"))?;
        println!("{text}");
    } else {
        println!("{}", message.body);
    }

    if !message.attachments.is_empty() {
        println!("{}", "-".repeat(80));
        println!("Attachments:");
        for attachment in &message.attachments {
            println!(
                "  {} ({}, {} bytes) id={}",
                attachment.filename, attachment.mime_type, attachment.size_bytes, attachment.id
            );
        }
    }
    Ok(())
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}
