//! Read and result-persistence helpers used by the compute engine (C9).
//! Reads go straight through the writer's connection (concurrent reads are
//! safe under `busy_timeout`); writes are queued through the batch path.

use rusqlite::types::Value;

use crate::error::{Result, WarehouseError};
use crate::types::{AnalysisStatus, Conversation, FacetKind, FacetRow};
use crate::writer::{WriteOp, Writer};

/// Plain-text transcript of a conversation, one line per message, in
/// timestamp order — the encoded form handed to the prompt compiler.
pub fn load_conversation_text(writer: &Writer, conversation_id: i64, max_messages: usize) -> Result<String> {
    let conversation = load_conversation(writer, conversation_id)?;
    let limit = if max_messages == 0 { i64::MAX } else { max_messages as i64 };

    let lines: Vec<String> = writer.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT m.timestamp, COALESCE(c.name, c.nickname, 'them'), m.is_from_me, m.content
             FROM messages m
             LEFT JOIN contacts c ON c.id = m.sender_id
             WHERE m.conversation_id = ?1 AND m.content IS NOT NULL
             ORDER BY m.timestamp ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(rusqlite::params![conversation_id, limit], |row| {
            let timestamp: i64 = row.get(0)?;
            let sender: String = row.get(1)?;
            let is_from_me: i64 = row.get(2)?;
            let content: String = row.get(3)?;
            let who = if is_from_me != 0 { "me" } else { sender.as_str() };
            Ok(format!("[{timestamp}] {who}: {content}"))
        })?;
        rows.collect::<rusqlite::Result<_>>()
    })?;

    let _ = conversation;
    Ok(lines.join("\n"))
}

pub fn load_conversation(writer: &Writer, conversation_id: i64) -> Result<Conversation> {
    writer
        .with_connection(|conn| {
            conn.query_row(
                "SELECT id, chat_id, start_time, end_time, message_count, initiator_id, gap_threshold
                 FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        chat_id: row.get(1)?,
                        start_time: row.get(2)?,
                        end_time: row.get(3)?,
                        message_count: row.get(4)?,
                        initiator_id: row.get(5)?,
                        gap_threshold: row.get(6)?,
                    })
                },
            )
        })
        .map_err(|_| WarehouseError::ConversationNotFound(conversation_id))
}

/// Persist a completed analysis: the raw completion, the analysis status
/// row, and any facet rows, as one logical write (independent upserts, all
/// individually idempotent).
pub fn persist_analysis_success(
    writer: &Writer,
    conversation_id: i64,
    chat_id: i64,
    prompt_template_id: &str,
    compiled_prompt_text: &str,
    model: &str,
    result_json: &str,
    facets: &[(FacetKind, FacetRow)],
    now: i64,
) -> Result<()> {
    writer.write(WriteOp::new(
        "INSERT INTO completions (conversation_id, chat_id, prompt_template_id, compiled_prompt_text, model, result, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        vec![
            Value::Integer(conversation_id),
            Value::Integer(chat_id),
            Value::Text(prompt_template_id.to_string()),
            Value::Text(compiled_prompt_text.to_string()),
            Value::Text(model.to_string()),
            Value::Text(result_json.to_string()),
            Value::Integer(now),
        ],
    ))?;
    writer.flush()?;
    let completion_id = writer.last_insert_rowid();

    writer.write(WriteOp::new(
        "INSERT INTO conversation_analyses (conversation_id, prompt_template_id, status, completion_id)
         VALUES (?1, ?2, 'succeeded', ?3)
         ON CONFLICT (conversation_id, prompt_template_id) DO UPDATE SET
            status = 'succeeded', completion_id = excluded.completion_id, error_message = NULL",
        vec![
            Value::Integer(conversation_id),
            Value::Text(prompt_template_id.to_string()),
            Value::Integer(completion_id),
        ],
    ))?;

    for (kind, row) in facets {
        let table = kind.table_name();
        // `contact_id` is nullable and SQL NULL is never equal to NULL under
        // a UNIQUE index, so the `(conversation_id, contact_id, item_value)`
        // index only catches conflicts when a contact is attributed. Rows
        // with no attributed contact conflict on the partial index instead
        // (see migrations/warehouse/0004_facet_null_contact_index.sql).
        let conflict_target = if row.contact_id.is_some() {
            "(conversation_id, contact_id, item_value)"
        } else {
            "(conversation_id, item_value) WHERE contact_id IS NULL"
        };
        writer.write(WriteOp::new(
            format!(
                "INSERT INTO {table} (conversation_id, chat_id, contact_id, item_value)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT {conflict_target} DO NOTHING"
            ),
            vec![
                Value::Integer(row.conversation_id),
                Value::Integer(row.chat_id),
                row.contact_id.map(Value::Integer).unwrap_or(Value::Null),
                Value::Text(row.item_value.clone()),
            ],
        ))?;
    }
    writer.flush()
}

/// Content was blocked by the provider's safety filter: terminal, not retried.
pub fn persist_analysis_blocked(
    writer: &Writer,
    conversation_id: i64,
    prompt_template_id: &str,
    blocked_reason: &str,
    blocked_reason_message: &str,
    now: i64,
) -> Result<()> {
    writer.write(WriteOp::new(
        "INSERT INTO conversation_analyses (conversation_id, prompt_template_id, status, blocked_reason, blocked_reason_message, blocked_at)
         VALUES (?1, ?2, 'blocked', ?3, ?4, ?5)
         ON CONFLICT (conversation_id, prompt_template_id) DO UPDATE SET
            status = 'blocked', blocked_reason = excluded.blocked_reason,
            blocked_reason_message = excluded.blocked_reason_message, blocked_at = excluded.blocked_at",
        vec![
            Value::Integer(conversation_id),
            Value::Text(prompt_template_id.to_string()),
            Value::Text(blocked_reason.to_string()),
            Value::Text(blocked_reason_message.to_string()),
            Value::Integer(now),
        ],
    ))?;
    writer.flush()
}

pub fn persist_analysis_failure(
    writer: &Writer,
    conversation_id: i64,
    prompt_template_id: &str,
    status: AnalysisStatus,
    error_message: &str,
) -> Result<()> {
    writer.write(WriteOp::new(
        "INSERT INTO conversation_analyses (conversation_id, prompt_template_id, status, error_message, retry_count)
         VALUES (?1, ?2, ?3, ?4, 1)
         ON CONFLICT (conversation_id, prompt_template_id) DO UPDATE SET
            status = excluded.status, error_message = excluded.error_message,
            retry_count = conversation_analyses.retry_count + 1",
        vec![
            Value::Integer(conversation_id),
            Value::Text(prompt_template_id.to_string()),
            Value::Text(status.as_str().to_string()),
            Value::Text(error_message.to_string()),
        ],
    ))?;
    writer.flush()
}

pub fn persist_embedding(
    writer: &Writer,
    entity_type: &str,
    entity_id: i64,
    model: &str,
    embedding_blob: &[u8],
    dimension: i64,
    now: i64,
) -> Result<()> {
    writer.write(WriteOp::new(
        "INSERT INTO embeddings (entity_type, entity_id, model, embedding_blob, dimension, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (entity_type, entity_id, model) DO UPDATE SET
            embedding_blob = excluded.embedding_blob, dimension = excluded.dimension, created_at = excluded.created_at",
        vec![
            Value::Text(entity_type.to_string()),
            Value::Integer(entity_id),
            Value::Text(model.to_string()),
            Value::Blob(embedding_blob.to_vec()),
            Value::Integer(dimension),
            Value::Integer(now),
        ],
    ))?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{spawn, Writer, WriterHandle};
    use crate::types::FacetRow;
    use eve_migrate::MigrationTarget;
    use std::sync::Arc;
    use std::time::Duration;

    fn test_handle() -> WriterHandle {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        eve_migrate::run(&mut conn, MigrationTarget::Warehouse).unwrap();
        spawn(conn, 50, Duration::from_secs(3600))
    }

    fn seed_chat_and_conversation(writer: &Writer) -> (i64, i64) {
        writer
            .write(WriteOp::new(
                "INSERT INTO chats (chat_identifier, total_messages) VALUES ('chat-1', 0)",
                vec![],
            ))
            .unwrap();
        writer.flush().unwrap();
        let chat_id = writer.last_insert_rowid();

        writer
            .write(WriteOp::new(
                "INSERT INTO conversations (chat_id, start_time, end_time, gap_threshold) VALUES (?1, 0, 0, 3600)",
                vec![Value::Integer(chat_id)],
            ))
            .unwrap();
        writer.flush().unwrap();
        let conversation_id = writer.last_insert_rowid();
        (chat_id, conversation_id)
    }

    #[tokio::test]
    async fn rerunning_analysis_does_not_duplicate_null_contact_facets() {
        let handle = test_handle();
        let writer: Arc<Writer> = handle.writer.clone();
        let (chat_id, conversation_id) = seed_chat_and_conversation(&writer);

        let facets = vec![(
            FacetKind::Entity,
            FacetRow { conversation_id, chat_id, contact_id: None, item_value: "Alice".to_string() },
        )];

        for _ in 0..2 {
            persist_analysis_success(
                &writer,
                conversation_id,
                chat_id,
                "prompt-1",
                "compiled text",
                "test-model",
                "{}",
                &facets,
                1000,
            )
            .unwrap();
        }

        let count: i64 = writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1, "retried analysis must not duplicate a NULL-contact facet row");

        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn facets_with_distinct_contacts_do_not_collide() {
        let handle = test_handle();
        let writer: Arc<Writer> = handle.writer.clone();
        let (chat_id, conversation_id) = seed_chat_and_conversation(&writer);

        writer
            .write(WriteOp::new("INSERT INTO contacts (name, is_me) VALUES ('A', 0)", vec![]))
            .unwrap();
        writer.flush().unwrap();
        let contact_a = writer.last_insert_rowid();
        writer
            .write(WriteOp::new("INSERT INTO contacts (name, is_me) VALUES ('B', 0)", vec![]))
            .unwrap();
        writer.flush().unwrap();
        let contact_b = writer.last_insert_rowid();

        let facets = vec![
            (
                FacetKind::Topic,
                FacetRow { conversation_id, chat_id, contact_id: Some(contact_a), item_value: "trip".to_string() },
            ),
            (
                FacetKind::Topic,
                FacetRow { conversation_id, chat_id, contact_id: Some(contact_b), item_value: "trip".to_string() },
            ),
        ];
        persist_analysis_success(
            &writer, conversation_id, chat_id, "prompt-1", "compiled text", "test-model", "{}", &facets, 1000,
        )
        .unwrap();

        let count: i64 = writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM topics", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 2, "same item_value attributed to different contacts must not conflict");

        handle.close().await.unwrap();
    }
}
