//! ETL extractors and loaders (C6): incremental sync from the Messages
//! source database into the warehouse, bounded by `(chatdb, message_rowid)`.

use std::collections::HashMap;

use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use tracing::info;

use crate::error::Result;
use crate::source::{self, SourceDb};
use crate::types::{IdentifierType, MembershipAction, ReactionType};
use crate::watermark;
use crate::windowing;
use crate::writer::{WriteOp, Writer};

const WATERMARK_SOURCE: &str = "chatdb";
const WATERMARK_NAME: &str = "message_rowid";

#[derive(Debug, Default, serde::Serialize)]
pub struct SyncStats {
    pub chats_upserted: usize,
    pub contacts_upserted: usize,
    pub messages_upserted: usize,
    pub attachments_upserted: usize,
    pub reactions_upserted: usize,
    pub membership_events_upserted: usize,
    pub conversations_touched: usize,
    pub from_rowid: i64,
    pub to_rowid: i64,
}

/// Run one full incremental sync pass. Idempotent: re-running with the
/// same watermark produces no duplicate rows.
pub fn sync(source_path: &str, writer: &Writer, gap_seconds: i64) -> Result<SyncStats> {
    let source = SourceDb::open_read_only(source_path)?;
    let since_rowid = watermark::read_int(writer, WATERMARK_SOURCE, WATERMARK_NAME)?;
    let max_rowid = source.max_message_rowid()?;

    let mut stats = SyncStats {
        from_rowid: since_rowid,
        to_rowid: max_rowid,
        ..Default::default()
    };

    if max_rowid <= since_rowid {
        info!(since_rowid, max_rowid, "nothing new to sync");
        return Ok(stats);
    }

    let handle_to_contact = sync_contacts(writer, &source, &mut stats)?;
    let chat_to_id = sync_chats(writer, &source, &handle_to_contact, &mut stats)?;
    let (touched_chats, message_id_by_source_rowid) = sync_messages(
        writer,
        &source,
        since_rowid,
        max_rowid,
        &chat_to_id,
        &handle_to_contact,
        &mut stats,
    )?;
    sync_attachments(writer, &source, since_rowid, max_rowid, &message_id_by_source_rowid, &mut stats)?;
    sync_reactions(writer, &source, since_rowid, max_rowid, &chat_to_id, &handle_to_contact, &mut stats)?;
    sync_membership_events(writer, &source, since_rowid, max_rowid, &chat_to_id, &handle_to_contact, &mut stats)?;

    for chat_id in &touched_chats {
        windowing::window_chat(writer, *chat_id, gap_seconds)?;
    }
    stats.conversations_touched = touched_chats.len();

    let now = eve_core::time::now_unix_secs();
    watermark::advance_int(writer, WATERMARK_SOURCE, WATERMARK_NAME, max_rowid, now)?;
    writer.flush()?;

    info!(
        from = since_rowid,
        to = max_rowid,
        messages = stats.messages_upserted,
        "sync pass complete"
    );
    Ok(stats)
}

/// Upsert a contact per source handle, resolving by identifier so re-runs
/// never create duplicates. Returns `handle_rowid -> contact_id`.
fn sync_contacts(
    writer: &Writer,
    source: &SourceDb,
    stats: &mut SyncStats,
) -> Result<HashMap<i64, i64>> {
    let handles = source::fetch_handles(source)?;
    let mut map = HashMap::with_capacity(handles.len());

    for handle in handles {
        let existing: Option<i64> = writer.with_connection(|conn| {
            conn.query_row(
                "SELECT contact_id FROM contact_identifiers WHERE identifier = ?1",
                [&handle.id],
                |row| row.get(0),
            )
            .optional()
        })?;

        let contact_id = match existing {
            Some(id) => id,
            None => {
                writer.write(WriteOp::new(
                    "INSERT INTO contacts (name, nickname, is_me, data_source) VALUES (NULL, NULL, 0, 'chatdb')",
                    vec![],
                ))?;
                writer.flush()?;
                let id = writer.last_insert_rowid();

                let kind = IdentifierType::classify(&handle.id);
                writer.write(WriteOp::new(
                    "INSERT INTO contact_identifiers (contact_id, identifier, type, is_primary)
                     VALUES (?1, ?2, ?3, 1)
                     ON CONFLICT (contact_id, identifier) DO NOTHING",
                    vec![
                        Value::Integer(id),
                        Value::Text(handle.id.clone()),
                        Value::Text(kind.as_str().to_string()),
                    ],
                ))?;
                stats.contacts_upserted += 1;
                id
            }
        };
        map.insert(handle.rowid, contact_id);
    }
    writer.flush()?;
    Ok(map)
}

/// Upsert chats and their participant set. Returns `chat_rowid -> chat_id`.
fn sync_chats(
    writer: &Writer,
    source: &SourceDb,
    handle_to_contact: &HashMap<i64, i64>,
    stats: &mut SyncStats,
) -> Result<HashMap<i64, i64>> {
    let chats = source::fetch_chats(source)?;
    let participants = source::fetch_chat_participants(source)?;
    let mut participants_by_chat: HashMap<i64, Vec<i64>> = HashMap::new();
    for (chat_rowid, handle_rowid) in participants {
        participants_by_chat.entry(chat_rowid).or_default().push(handle_rowid);
    }

    let mut map = HashMap::with_capacity(chats.len());
    for chat in chats {
        let member_count = participants_by_chat.get(&chat.rowid).map(Vec::len).unwrap_or(0);
        let is_group = member_count > 1;
        let name = chat.display_name.or(chat.room_name);

        writer.write(WriteOp::new(
            "INSERT INTO chats (chat_identifier, chat_name, is_group, created_date, last_message_date, total_messages)
             VALUES (?1, ?2, ?3, NULL, NULL, 0)
             ON CONFLICT (chat_identifier) DO UPDATE SET chat_name = excluded.chat_name, is_group = excluded.is_group",
            vec![
                Value::Text(chat.chat_identifier.clone()),
                name.map(Value::Text).unwrap_or(Value::Null),
                Value::Integer(is_group as i64),
            ],
        ))?;
        writer.flush()?;

        let chat_id: i64 = writer.with_connection(|conn| {
            conn.query_row(
                "SELECT id FROM chats WHERE chat_identifier = ?1",
                [&chat.chat_identifier],
                |row| row.get(0),
            )
        })?;
        stats.chats_upserted += 1;
        map.insert(chat.rowid, chat_id);

        for handle_rowid in participants_by_chat.get(&chat.rowid).into_iter().flatten() {
            if let Some(contact_id) = handle_to_contact.get(handle_rowid) {
                writer.write(WriteOp::new(
                    "INSERT INTO chat_participants (chat_id, contact_id) VALUES (?1, ?2)
                     ON CONFLICT (chat_id, contact_id) DO NOTHING",
                    vec![Value::Integer(chat_id), Value::Integer(*contact_id)],
                ))?;
            }
        }
    }
    writer.flush()?;
    Ok(map)
}

fn sync_messages(
    writer: &Writer,
    source: &SourceDb,
    since_rowid: i64,
    max_rowid: i64,
    chat_to_id: &HashMap<i64, i64>,
    handle_to_contact: &HashMap<i64, i64>,
    stats: &mut SyncStats,
) -> Result<(Vec<i64>, HashMap<i64, i64>)> {
    let rows = source::fetch_messages_since(source, since_rowid, max_rowid)?;
    let mut touched_chats = Vec::new();
    let mut source_rowid_to_guid = HashMap::with_capacity(rows.len());

    for row in &rows {
        let Some(&chat_id) = chat_to_id.get(&row.chat_rowid) else {
            continue;
        };
        let sender_id = row.handle_rowid.and_then(|h| handle_to_contact.get(&h)).copied();
        let timestamp_ns = eve_core::time::apple_ns_to_unix_ns(row.date_apple_ns);

        writer.write(WriteOp::new(
            "INSERT INTO messages (guid, chat_id, sender_id, content, timestamp, is_from_me,
                                    reply_to_guid, associated_message_guid, message_type, service_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (guid) DO UPDATE SET content = excluded.content, timestamp = excluded.timestamp",
            vec![
                Value::Text(row.guid.clone()),
                Value::Integer(chat_id),
                sender_id.map(Value::Integer).unwrap_or(Value::Null),
                row.text.clone().map(Value::Text).unwrap_or(Value::Null),
                Value::Integer(timestamp_ns),
                Value::Integer(row.is_from_me as i64),
                row.reply_to_guid.clone().map(Value::Text).unwrap_or(Value::Null),
                row.associated_message_guid.clone().map(Value::Text).unwrap_or(Value::Null),
                Value::Text("text".to_string()),
                row.service.clone().map(Value::Text).unwrap_or(Value::Null),
            ],
        ))?;
        stats.messages_upserted += 1;
        source_rowid_to_guid.insert(row.rowid, row.guid.clone());
        if !touched_chats.contains(&chat_id) {
            touched_chats.push(chat_id);
        }
    }
    writer.flush()?;

    let mut message_id_by_source_rowid = HashMap::with_capacity(source_rowid_to_guid.len());
    for (source_rowid, guid) in &source_rowid_to_guid {
        let message_id: i64 = writer.with_connection(|conn| {
            conn.query_row("SELECT id FROM messages WHERE guid = ?1", [guid], |row| row.get(0))
        })?;
        message_id_by_source_rowid.insert(*source_rowid, message_id);
    }

    for &chat_id in &touched_chats {
        writer.write(WriteOp::new(
            "UPDATE chats SET
                total_messages = (SELECT COUNT(*) FROM messages WHERE chat_id = ?1),
                last_message_date = (SELECT MAX(timestamp) FROM messages WHERE chat_id = ?1)
             WHERE id = ?1",
            vec![Value::Integer(chat_id)],
        ))?;
    }
    writer.flush()?;
    Ok((touched_chats, message_id_by_source_rowid))
}

fn sync_attachments(
    writer: &Writer,
    source: &SourceDb,
    since_rowid: i64,
    max_rowid: i64,
    message_id_by_source_rowid: &HashMap<i64, i64>,
    stats: &mut SyncStats,
) -> Result<()> {
    let rows = source::fetch_attachments_since(source, since_rowid, max_rowid)?;
    for row in rows {
        let Some(&message_id) = message_id_by_source_rowid.get(&row.message_rowid) else {
            continue;
        };

        writer.write(WriteOp::new(
            "INSERT INTO attachments (guid, message_id, file_name, mime_type, size, is_sticker, uti)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (guid) DO UPDATE SET file_name = excluded.file_name",
            vec![
                Value::Text(row.guid),
                Value::Integer(message_id),
                row.filename.map(Value::Text).unwrap_or(Value::Null),
                row.mime_type.map(Value::Text).unwrap_or(Value::Null),
                row.total_bytes.map(Value::Integer).unwrap_or(Value::Null),
                Value::Integer(row.is_sticker as i64),
                row.uti.map(Value::Text).unwrap_or(Value::Null),
            ],
        ))?;
        stats.attachments_upserted += 1;
    }
    writer.flush()?;
    Ok(())
}

fn sync_reactions(
    writer: &Writer,
    source: &SourceDb,
    since_rowid: i64,
    max_rowid: i64,
    chat_to_id: &HashMap<i64, i64>,
    handle_to_contact: &HashMap<i64, i64>,
    stats: &mut SyncStats,
) -> Result<()> {
    let rows = source::fetch_messages_since(source, since_rowid, max_rowid)?;
    for row in &rows {
        let Some(ref assoc_guid) = row.associated_message_guid else {
            continue;
        };
        let Some(&chat_id) = chat_to_id.get(&row.chat_rowid) else {
            continue;
        };

        let reaction_type = ReactionType::from_legacy_code(row.associated_message_type)
            .or_else(|| row.text.as_deref().and_then(ReactionType::from_text_prefix));
        let Some(reaction_type) = reaction_type else {
            continue;
        };

        let sender_id = row.handle_rowid.and_then(|h| handle_to_contact.get(&h)).copied();
        let original_guid = source::normalize_guid(assoc_guid).to_string();
        let timestamp_ns = eve_core::time::apple_ns_to_unix_ns(row.date_apple_ns);

        writer.write(WriteOp::new(
            "INSERT INTO reactions (guid, original_message_guid, timestamp, sender_id, chat_id,
                                     reaction_type, is_from_me)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (guid) DO UPDATE SET reaction_type = excluded.reaction_type",
            vec![
                Value::Text(row.guid.clone()),
                Value::Text(original_guid),
                Value::Integer(timestamp_ns),
                sender_id.map(Value::Integer).unwrap_or(Value::Null),
                Value::Integer(chat_id),
                Value::Integer(reaction_type.as_code()),
                Value::Integer(row.is_from_me as i64),
            ],
        ))?;
        stats.reactions_upserted += 1;
    }
    writer.flush()?;
    Ok(())
}

fn sync_membership_events(
    writer: &Writer,
    source: &SourceDb,
    since_rowid: i64,
    max_rowid: i64,
    chat_to_id: &HashMap<i64, i64>,
    handle_to_contact: &HashMap<i64, i64>,
    stats: &mut SyncStats,
) -> Result<()> {
    let rows = source::fetch_messages_since(source, since_rowid, max_rowid)?;
    for row in &rows {
        if row.group_action_type == 0 {
            continue;
        }
        let Some(&chat_id) = chat_to_id.get(&row.chat_rowid) else {
            continue;
        };

        let action = MembershipAction::from_group_action_type(row.group_action_type);
        let actor_id = row.handle_rowid.and_then(|h| handle_to_contact.get(&h)).copied();
        let timestamp_ns = eve_core::time::apple_ns_to_unix_ns(row.date_apple_ns);

        writer.write(WriteOp::new(
            "INSERT INTO membership_events (guid, chat_id, actor_id, member_id, action_type,
                                             item_type, message_action_type, group_title,
                                             timestamp, is_from_me)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (guid) DO UPDATE SET action_type = excluded.action_type",
            vec![
                Value::Text(row.guid.clone()),
                Value::Integer(chat_id),
                actor_id.map(Value::Integer).unwrap_or(Value::Null),
                Value::Text(action.as_str().to_string()),
                Value::Integer(row.item_type),
                Value::Integer(row.group_action_type),
                row.group_title.clone().map(Value::Text).unwrap_or(Value::Null),
                Value::Integer(timestamp_ns),
                Value::Integer(row.is_from_me as i64),
            ],
        ))?;
        stats.membership_events_upserted += 1;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::spawn;
    use eve_migrate::MigrationTarget;
    use std::time::Duration;

    /// Builds a minimal Messages-shaped source database on disk (ETL opens
    /// its source read-only, so the fixture can't be in-memory-only).
    fn build_source_db() -> tempfile::TempPath {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.into_temp_path();
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, chat_identifier TEXT, display_name TEXT, room_name TEXT);
             CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT);
             CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
             CREATE TABLE message (
                ROWID INTEGER PRIMARY KEY, guid TEXT, handle_id INTEGER, text TEXT, date INTEGER,
                is_from_me INTEGER, reply_to_guid TEXT, associated_message_guid TEXT,
                associated_message_type INTEGER, item_type INTEGER, group_action_type INTEGER,
                group_title TEXT, service TEXT
             );
             CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
             CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY, guid TEXT, filename TEXT, mime_type TEXT, total_bytes INTEGER, is_sticker INTEGER, uti TEXT);
             CREATE TABLE chat_message_attachment_join (attachment_id INTEGER, message_id INTEGER);

             INSERT INTO chat VALUES (1, 'chat-alpha', NULL, NULL);
             INSERT INTO handle VALUES (1, '+15551234567');
             INSERT INTO chat_handle_join VALUES (1, 1);

             INSERT INTO message VALUES
                (1, 'msg-guid-1', 1, 'hello there', 1000000000, 0, NULL, NULL, 0, 0, 0, NULL, 'iMessage'),
                (2, 'msg-guid-2', NULL, 'hi back', 2000000000, 1, NULL, NULL, 0, 0, 0, NULL, 'iMessage'),
                (3, 'reaction-guid-1', 1, 'Loved “hi back”', 3000000000, 0, NULL, '36-char-placeholder-aaaaaaaaaaaaaaaaaaaa', 0, 0, 0, NULL, 'iMessage');

             INSERT INTO chat_message_join VALUES (1, 1), (1, 2), (1, 3);

             INSERT INTO attachment VALUES (1, 'att-guid-1', 'photo.jpg', 'image/jpeg', 1024, 0, 'public.jpeg');
             INSERT INTO chat_message_attachment_join VALUES (1, 1);",
        )
        .unwrap();
        path
    }

    async fn test_writer() -> crate::writer::WriterHandle {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        eve_migrate::run(&mut conn, MigrationTarget::Warehouse).unwrap();
        spawn(conn, 50, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn sync_populates_chats_contacts_and_messages() {
        let source_path = build_source_db();
        let handle = test_writer().await;

        let stats = sync(source_path.to_str().unwrap(), &handle.writer, 10_800).unwrap();
        assert_eq!(stats.chats_upserted, 1);
        assert_eq!(stats.messages_upserted, 3);
        assert_eq!(stats.attachments_upserted, 1);
        assert_eq!(stats.reactions_upserted, 1);

        let message_count: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(message_count, 3);

        let reaction_row: (String, i64) = handle
            .writer
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT original_message_guid, reaction_type FROM reactions WHERE guid = 'reaction-guid-1'",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(reaction_row.0, "har-placeholder-aaaaaaaaaaaaaaaaaaaa");
        assert_eq!(reaction_row.1, ReactionType::Loved.as_code());

        let chat_name: Option<String> = handle
            .writer
            .with_connection(|conn| {
                conn.query_row("SELECT chat_name FROM chats WHERE chat_identifier = 'chat-alpha'", [], |r| r.get(0))
            })
            .unwrap();
        assert!(chat_name.is_none());

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn rerunning_sync_with_same_watermark_is_idempotent() {
        let source_path = build_source_db();
        let handle = test_writer().await;

        sync(source_path.to_str().unwrap(), &handle.writer, 10_800).unwrap();
        let second = sync(source_path.to_str().unwrap(), &handle.writer, 10_800).unwrap();
        assert_eq!(second.messages_upserted, 0, "no new rows past the watermark");

        let message_count: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(message_count, 3);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn windowing_runs_after_sync_and_assigns_conversations() {
        let source_path = build_source_db();
        let handle = test_writer().await;

        sync(source_path.to_str().unwrap(), &handle.writer, 10_800).unwrap();

        let unassigned: i64 = handle
            .writer
            .with_connection(|conn| {
                conn.query_row("SELECT COUNT(*) FROM messages WHERE conversation_id IS NULL", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(unassigned, 0);
        handle.close().await.unwrap();
    }
}
