use clap::{Args, Parser, Subcommand};
use deskmirror_core::EntityType;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "deskmirror",
    version,
    about = "Local SQLite mirror of a remote helpdesk"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Connection settings shared by every subcommand. Each flag falls back to
/// its environment variable.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// SQLite file holding the mirror.
    #[arg(long, env = "DESKMIRROR_DB_PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// Helpdesk base URL, e.g. https://acme.freshdesk.com
    #[arg(long, env = "DESKMIRROR_REMOTE_URL", global = true)]
    pub remote_url: Option<String>,

    #[arg(long, env = "DESKMIRROR_API_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Records requested per list page (max 100).
    #[arg(long, env = "DESKMIRROR_PAGE_SIZE", global = true)]
    pub page_size: Option<usize>,

    /// Seconds before a cached ticket is refetched on read.
    #[arg(long, env = "DESKMIRROR_STALE_AFTER_SECS", global = true)]
    pub stale_after_secs: Option<u64>,
}

impl GlobalArgs {
    /// Config lookup: flags first, then the process environment.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let flag = match key {
            "DESKMIRROR_DB_PATH" => self.db_path.as_ref().map(|p| p.display().to_string()),
            "DESKMIRROR_REMOTE_URL" => self.remote_url.clone(),
            "DESKMIRROR_API_KEY" => self.api_key.clone(),
            "DESKMIRROR_PAGE_SIZE" => self.page_size.map(|v| v.to_string()),
            "DESKMIRROR_STALE_AFTER_SECS" => self.stale_after_secs.map(|v| v.to_string()),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Pull every entity type from the helpdesk (or only one with --only).
    Sync {
        #[arg(long)]
        only: Option<EntityType>,
    },

    /// Print a ticket, refetching it first when the cached copy is stale.
    ShowTicket {
        /// Local ticket id.
        id: i64,
    },

    /// Print one mirrored record without contacting the helpdesk.
    Get {
        entity_type: EntityType,
        id: i64,
    },

    /// List mirrored records of one type.
    List {
        entity_type: EntityType,

        /// Only records carrying this tag.
        #[arg(long)]
        tag: Option<String>,

        /// Column filter as `column=value`; the value is parsed as JSON when
        /// possible, so `status=2` and `email="a@b.c"` both work.
        #[arg(long = "filter")]
        filters: Vec<String>,

        #[arg(long)]
        order_by: Option<String>,

        #[arg(long)]
        desc: bool,

        #[arg(long)]
        include_deleted: bool,

        #[arg(long, default_value = "50")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Create a record remotely and mirror the result.
    Create {
        entity_type: EntityType,

        /// JSON object using local ids for references.
        #[arg(long)]
        json: String,

        /// Files uploaded as attachments (switches to multipart).
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },

    /// Update a record remotely and write the submitted fields back.
    Update {
        entity_type: EntityType,
        id: i64,

        #[arg(long)]
        json: String,
    },

    /// Delete a record remotely, then soft delete it locally.
    Delete {
        entity_type: EntityType,
        id: i64,
    },

    /// Merge contacts into a primary contact.
    MergeContacts {
        /// Local id of the surviving contact.
        primary: i64,

        /// Comma-delimited local ids of the contacts merged away.
        #[arg(long, value_delimiter = ',', required = true)]
        secondaries: Vec<i64>,

        /// JSON object of fields to set on the primary contact.
        #[arg(long)]
        overrides: Option<String>,
    },

    /// Merge tickets into a primary ticket.
    MergeTickets {
        primary: i64,

        #[arg(long, value_delimiter = ',', required = true)]
        secondaries: Vec<i64>,

        /// Note added to the primary ticket.
        #[arg(long)]
        note_in_primary: Option<String>,

        /// Note added to each secondary ticket.
        #[arg(long)]
        note_in_secondary: Option<String>,

        /// Post the notes as public replies instead of private notes.
        #[arg(long)]
        public_notes: bool,

        #[arg(long)]
        convert_recipients_to_cc: bool,
    },

    /// Print the effective configuration (secrets redacted).
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_merge_tickets() {
        let cli = Cli::try_parse_from([
            "deskmirror",
            "merge-tickets",
            "3",
            "--secondaries",
            "4,5",
            "--note-in-primary",
            "merged",
            "--convert-recipients-to-cc",
        ])
        .unwrap();
        match cli.command {
            Commands::MergeTickets {
                primary,
                secondaries,
                note_in_primary,
                public_notes,
                convert_recipients_to_cc,
                ..
            } => {
                assert_eq!(primary, 3);
                assert_eq!(secondaries, vec![4, 5]);
                assert_eq!(note_in_primary.as_deref(), Some("merged"));
                assert!(!public_notes);
                assert!(convert_recipients_to_cc);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_entity_types_and_rejects_unknown_ones() {
        let cli = Cli::try_parse_from(["deskmirror", "sync", "--only", "ticket"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Sync {
                only: Some(EntityType::Ticket)
            }
        ));
        assert!(Cli::try_parse_from(["deskmirror", "delete", "widget", "1"]).is_err());
    }

    #[test]
    fn flags_win_over_environment() {
        let args = GlobalArgs {
            page_size: Some(25),
            remote_url: Some("https://acme.example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(args.lookup("DESKMIRROR_PAGE_SIZE").as_deref(), Some("25"));
        assert_eq!(
            args.lookup("DESKMIRROR_REMOTE_URL").as_deref(),
            Some("https://acme.example.com")
        );
    }
}
