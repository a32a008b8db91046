use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line options for postbox.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Account key for the stored grant (overrides POSTBOX_ACCOUNT).
    #[arg(long, global = true)]
    pub account: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in through the browser and store the grant
    Login,
    /// Forget the stored grant
    Logout,
    /// Show the first page of the inbox
    List,
    /// Load the inbox up to the fetch cap, like the background prefetch does
    Sync,
    /// Show one message; marks it read when it was unread
    Show {
        id: String,
        /// Print HTML bodies as-is instead of rendering them to text
        #[arg(long)]
        raw: bool,
    },
    MarkRead {
        id: String,
    },
    MarkUnread {
        id: String,
    },
    /// Save an attachment to disk
    Download {
        message_id: String,
        attachment_id: String,
        /// Output path (defaults to the attachment id in the current directory)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Validate an outgoing message (sending is not implemented)
    Compose {
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "")]
        subject: String,
        #[arg(long, default_value = "")]
        body: String,
    },
}
