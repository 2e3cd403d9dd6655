//! Conversation windowing (C7): partitions a chat's messages into maximal
//! contiguous runs where consecutive timestamps are within `gap_threshold`.

use rusqlite::types::Value;

use crate::error::Result;
use crate::writer::{WriteOp, Writer};

struct MessageRow {
    id: i64,
    sender_id: Option<i64>,
    timestamp: i64,
}

/// Re-window one chat. Anchors on the earliest not-yet-assigned message,
/// pulls in the nearest prior conversation if it's within the gap threshold
/// (so a new message can still bridge into it), and re-derives conversations
/// forward from there. Upserts are keyed on `(chat_id, start_time)`, so
/// re-running with the same window is a no-op; any conversation row left
/// orphaned by a merge is deleted below.
pub fn window_chat(writer: &Writer, chat_id: i64, gap_seconds_as_unit: i64) -> Result<()> {
    // `timestamp` is stored in nanoseconds; the configured gap is in seconds.
    let gap_ns = gap_seconds_as_unit.saturating_mul(1_000_000_000);

    let earliest_unassigned: Option<i64> = writer.with_connection(|conn| {
        conn.query_row(
            "SELECT MIN(timestamp) FROM messages WHERE chat_id = ?1 AND conversation_id IS NULL",
            [chat_id],
            |row| row.get::<_, Option<i64>>(0),
        )
    })?;
    let Some(earliest_unassigned) = earliest_unassigned else {
        return Ok(()); // nothing new to window
    };

    // The nearest existing conversation ending within the gap threshold
    // before the first new message absorbs it; otherwise the new message
    // starts its own run and older, already-finalized conversations are
    // left untouched.
    let window_start: i64 = writer.with_connection(|conn| {
        conn.query_row(
            "SELECT COALESCE(MIN(start_time), ?2) FROM conversations
             WHERE chat_id = ?1 AND end_time <= ?2 AND end_time >= ?2 - ?3",
            rusqlite::params![chat_id, earliest_unassigned, gap_ns],
            |row| row.get(0),
        )
    })?;

    let messages: Vec<MessageRow> = writer.with_connection(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, sender_id, timestamp FROM messages
             WHERE chat_id = ?1 AND timestamp >= ?2
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![chat_id, window_start], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                sender_id: row.get(1)?,
                timestamp: row.get(2)?,
            })
        })?;
        rows.collect()
    })?;

    if messages.is_empty() {
        return Ok(());
    }

    struct Run {
        start_time: i64,
        end_time: i64,
        message_count: i64,
        initiator_id: Option<i64>,
        message_ids: Vec<i64>,
    }

    let mut runs: Vec<Run> = Vec::new();
    for msg in &messages {
        match runs.last_mut() {
            Some(run) if msg.timestamp - run.end_time <= gap_ns => {
                run.end_time = msg.timestamp;
                run.message_count += 1;
                run.message_ids.push(msg.id);
            }
            _ => {
                runs.push(Run {
                    start_time: msg.timestamp,
                    end_time: msg.timestamp,
                    message_count: 1,
                    initiator_id: msg.sender_id,
                    message_ids: vec![msg.id],
                });
            }
        }
    }

    let run_starts: Vec<i64> = runs.iter().map(|r| r.start_time).collect();

    for run in runs {
        writer.write(WriteOp::new(
            "INSERT INTO conversations (chat_id, start_time, end_time, message_count, initiator_id, gap_threshold)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (chat_id, start_time) DO UPDATE SET
                end_time = excluded.end_time,
                message_count = excluded.message_count,
                gap_threshold = excluded.gap_threshold",
            vec![
                Value::Integer(chat_id),
                Value::Integer(run.start_time),
                Value::Integer(run.end_time),
                Value::Integer(run.message_count),
                run.initiator_id.map(Value::Integer).unwrap_or(Value::Null),
                Value::Integer(gap_seconds_as_unit),
            ],
        ))?;
        writer.flush()?;

        let conversation_id: i64 = writer.with_connection(|conn| {
            conn.query_row(
                "SELECT id FROM conversations WHERE chat_id = ?1 AND start_time = ?2",
                rusqlite::params![chat_id, run.start_time],
                |row| row.get(0),
            )
        })?;

        for message_id in &run.message_ids {
            writer.write(WriteOp::new(
                "UPDATE messages SET conversation_id = ?1 WHERE id = ?2",
                vec![Value::Integer(conversation_id), Value::Integer(*message_id)],
            ))?;
        }
    }

    // A new message can bridge two runs that were previously separate
    // conversations; re-deriving above absorbs the earlier one's messages
    // into the surviving run but leaves its now-stale conversation row
    // behind. Delete anything in the re-derived window whose start_time
    // isn't one of the runs just upserted.
    let placeholders = (0..run_starts.len()).map(|i| format!("?{}", i + 3)).collect::<Vec<_>>().join(", ");
    let mut delete_params = vec![Value::Integer(chat_id), Value::Integer(window_start)];
    delete_params.extend(run_starts.into_iter().map(Value::Integer));
    writer.write(WriteOp::new(
        format!(
            "DELETE FROM conversations WHERE chat_id = ?1 AND start_time >= ?2 AND start_time NOT IN ({placeholders})"
        ),
        delete_params,
    ))?;

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::spawn;
    use eve_migrate::MigrationTarget;
    use std::time::Duration;

    async fn test_writer() -> crate::writer::WriterHandle {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        eve_migrate::run(&mut conn, MigrationTarget::Warehouse).unwrap();
        spawn(conn, 50, Duration::from_secs(3600))
    }

    fn insert_chat(writer: &Writer) -> i64 {
        writer
            .write(WriteOp::new(
                "INSERT INTO chats (chat_identifier, is_group, total_messages) VALUES ('c1', 0, 0)",
                vec![],
            ))
            .unwrap();
        writer.flush().unwrap();
        writer.last_insert_rowid()
    }

    fn insert_message(writer: &Writer, chat_id: i64, guid: &str, ts: i64) {
        writer
            .write(WriteOp::new(
                "INSERT INTO messages (guid, chat_id, timestamp) VALUES (?1, ?2, ?3)",
                vec![Value::Text(guid.to_string()), Value::Integer(chat_id), Value::Integer(ts)],
            ))
            .unwrap();
        writer.flush().unwrap();
    }

    #[tokio::test]
    async fn single_message_forms_length_one_conversation() {
        let handle = test_writer().await;
        let chat_id = insert_chat(&handle.writer);
        insert_message(&handle.writer, chat_id, "g1", 1_000_000_000_000);

        window_chat(&handle.writer, chat_id, 10_800).unwrap();

        let count: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn messages_within_gap_merge_into_one_conversation() {
        let handle = test_writer().await;
        let chat_id = insert_chat(&handle.writer);
        let one_hour_ns = 3_600_000_000_000;
        insert_message(&handle.writer, chat_id, "g1", 0);
        insert_message(&handle.writer, chat_id, "g2", one_hour_ns);
        insert_message(&handle.writer, chat_id, "g3", 2 * one_hour_ns);

        window_chat(&handle.writer, chat_id, 10_800).unwrap();

        let (count, message_count): (i64, i64) = handle
            .writer
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), MAX(message_count) FROM conversations",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(message_count, 3);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn gap_exceeding_threshold_splits_conversations() {
        let handle = test_writer().await;
        let chat_id = insert_chat(&handle.writer);
        let four_hours_ns = 4 * 3_600_000_000_000i64;
        insert_message(&handle.writer, chat_id, "g1", 0);
        insert_message(&handle.writer, chat_id, "g2", four_hours_ns);

        window_chat(&handle.writer, chat_id, 10_800).unwrap();

        let count: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 2);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn bridging_message_merges_runs_and_deletes_the_stale_row() {
        let handle = test_writer().await;
        let chat_id = insert_chat(&handle.writer);
        let one_hour_ns = 3_600_000_000_000i64;
        insert_message(&handle.writer, chat_id, "g1", 0);
        insert_message(&handle.writer, chat_id, "g2", 4 * one_hour_ns);

        window_chat(&handle.writer, chat_id, 10_800).unwrap();
        let count_before: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count_before, 2, "gap beyond the threshold must split into two conversations");

        insert_message(&handle.writer, chat_id, "g3", 2 * one_hour_ns);
        window_chat(&handle.writer, chat_id, 10_800).unwrap();

        let (count, message_count): (i64, i64) = handle
            .writer
            .with_connection(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), MAX(message_count) FROM conversations",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
            })
            .unwrap();
        assert_eq!(count, 1, "bridging message must merge both runs and delete the stale row");
        assert_eq!(message_count, 3);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn rerunning_same_window_is_a_no_op() {
        let handle = test_writer().await;
        let chat_id = insert_chat(&handle.writer);
        insert_message(&handle.writer, chat_id, "g1", 0);

        window_chat(&handle.writer, chat_id, 10_800).unwrap();
        window_chat(&handle.writer, chat_id, 10_800).unwrap();

        let count: i64 = handle
            .writer
            .with_connection(|conn| conn.query_row("SELECT COUNT(*) FROM conversations", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(count, 1);
        handle.close().await.unwrap();
    }
}
