use crate::cli::{Commands, GlobalArgs};
use anyhow::Context;
use deskmirror_core::{
    EntityType, Error, ListFilter, ListQuery, LocalId, LocalPayload, MergeNote, MirrorConfig,
    MirrorEngine, RemoteError, TicketMergeOptions, UploadFile,
};
use serde_json::{Value, json};
use std::path::Path;

/// Split `column=value`, reading the value as JSON when it parses and as a
/// plain string otherwise.
pub fn parse_filter(raw: &str) -> anyhow::Result<ListFilter> {
    let (column, value) = raw
        .split_once('=')
        .with_context(|| format!("filter '{raw}' is not column=value"))?;
    let column = column.trim();
    if column.is_empty() {
        anyhow::bail!("filter '{raw}' has an empty column");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok(ListFilter {
        column: column.to_string(),
        value,
    })
}

fn parse_payload(raw: &str) -> anyhow::Result<LocalPayload> {
    let value: Value = serde_json::from_str(raw).context("payload is not valid JSON")?;
    Ok(LocalPayload::from_value(value)?)
}

fn redact(s: &str) -> String {
    if s.len() <= 8 || !s.is_ascii() {
        return "***".to_string();
    }
    format!("{}***{}", &s[..4], &s[s.len() - 4..])
}

/// Effective settings after flag and environment resolution.
pub fn describe_config(global: &GlobalArgs) -> Value {
    let mirror = MirrorConfig::from_lookup(|k| global.lookup(k));
    json!({
        "DESKMIRROR_DB_PATH": mirror.as_ref().ok().map(|c| c.db_path.display().to_string()),
        "DESKMIRROR_PAGE_SIZE": mirror.as_ref().ok().map(|c| c.page_size),
        "DESKMIRROR_STALE_AFTER_SECS": mirror.as_ref().ok().map(|c| c.stale_after.as_secs()),
        "DESKMIRROR_REMOTE_URL": global.lookup("DESKMIRROR_REMOTE_URL"),
        "DESKMIRROR_API_KEY": global.lookup("DESKMIRROR_API_KEY").map(|v| redact(&v)),
        "DESKMIRROR_HTTP_TIMEOUT_MS": global.lookup("DESKMIRROR_HTTP_TIMEOUT_MS"),
        "DESKMIRROR_LOG_FORMAT": global.lookup("DESKMIRROR_LOG_FORMAT"),
        "error": mirror.err().map(|e| e.to_string()),
    })
}

/// `field: message` lines for a rejected payload, empty for any other error.
pub fn field_error_lines(err: &anyhow::Error) -> Vec<String> {
    let remote = err.chain().find_map(|e| {
        e.downcast_ref::<RemoteError>().or_else(|| match e.downcast_ref::<Error>() {
            Some(Error::Remote(r)) => Some(r),
            _ => None,
        })
    });
    remote
        .map(|r| {
            r.field_errors()
                .iter()
                .map(|f| format!("{}: {}", f.field, f.message))
                .collect()
        })
        .unwrap_or_default()
}

async fn read_attachment(path: &Path) -> anyhow::Result<UploadFile> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    Ok(UploadFile::attachment(file_name, data))
}

fn note(body: Option<String>, public: bool) -> Option<MergeNote> {
    body.map(|body| MergeNote {
        body,
        private: !public,
    })
}

/// Run one subcommand against the mirror and return what should be printed.
#[tracing::instrument(level = "debug", skip(engine))]
pub async fn execute(engine: &MirrorEngine, command: Commands) -> anyhow::Result<Value> {
    let out = match command {
        Commands::Sync { only: None } => {
            let report = engine.sync_all().await;
            let value = serde_json::to_value(&report)?;
            if !report.is_success() {
                println!("{}", serde_json::to_string_pretty(&value)?);
                let failed: Vec<String> = report
                    .failed_types()
                    .iter()
                    .map(EntityType::to_string)
                    .collect();
                anyhow::bail!("sync failed for: {}", failed.join(", "));
            }
            value
        }
        Commands::Sync { only: Some(ty) } => {
            let outcome = engine.sync_one(ty).await?;
            let value = serde_json::to_value(&outcome)?;
            if !outcome.success {
                println!("{}", serde_json::to_string_pretty(&value)?);
                anyhow::bail!("sync failed for {ty}");
            }
            value
        }
        Commands::ShowTicket { id } => serde_json::to_value(engine.show_ticket(LocalId(id)).await?)?,
        Commands::Get { entity_type, id } => {
            serde_json::to_value(engine.get(entity_type, LocalId(id)).await?)?
        }
        Commands::List {
            entity_type,
            tag,
            filters,
            order_by,
            desc,
            include_deleted,
            limit,
            offset,
        } => {
            let query = ListQuery {
                filters: filters
                    .iter()
                    .map(|f| parse_filter(f))
                    .collect::<anyhow::Result<_>>()?,
                tag,
                order_by,
                descending: desc,
                include_deleted,
                limit,
                offset,
            };
            serde_json::to_value(engine.list(entity_type, &query).await?)?
        }
        Commands::Create {
            entity_type,
            json,
            attachments,
        } => {
            let mut files = Vec::with_capacity(attachments.len());
            for path in &attachments {
                files.push(read_attachment(path).await?);
            }
            let created = engine
                .create(entity_type, parse_payload(&json)?, files)
                .await?;
            serde_json::to_value(created)?
        }
        Commands::Update {
            entity_type,
            id,
            json,
        } => {
            let updated = engine
                .update(entity_type, LocalId(id), parse_payload(&json)?)
                .await?;
            serde_json::to_value(updated)?
        }
        Commands::Delete { entity_type, id } => {
            serde_json::to_value(engine.delete(entity_type, LocalId(id)).await?)?
        }
        Commands::MergeContacts {
            primary,
            secondaries,
            overrides,
        } => {
            let overrides = match overrides {
                Some(raw) => parse_payload(&raw)?,
                None => LocalPayload::default(),
            };
            let secondaries: Vec<LocalId> = secondaries.into_iter().map(LocalId).collect();
            let outcome = engine
                .merge_contacts(LocalId(primary), &secondaries, overrides)
                .await?;
            serde_json::to_value(outcome)?
        }
        Commands::MergeTickets {
            primary,
            secondaries,
            note_in_primary,
            note_in_secondary,
            public_notes,
            convert_recipients_to_cc,
        } => {
            let options = TicketMergeOptions {
                note_in_primary: note(note_in_primary, public_notes),
                note_in_secondary: note(note_in_secondary, public_notes),
                convert_recipients_to_cc,
            };
            let secondaries: Vec<LocalId> = secondaries.into_iter().map(LocalId).collect();
            let outcome = engine
                .merge_tickets(LocalId(primary), &secondaries, &options)
                .await?;
            serde_json::to_value(outcome)?
        }
        Commands::Config => anyhow::bail!("config does not need a mirror connection"),
    };
    Ok(out)
}
