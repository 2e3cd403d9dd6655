//! Read-only access to the Messages source database (`chat.db`).
//!
//! Table shapes mirror the platform's Messages store: `message`, `chat`,
//! `chat_message_join`, `handle`, `chat_handle_join`, `attachment`,
//! `chat_message_attachment_join`.

use rusqlite::{Connection, OpenFlags};

use crate::error::Result;

pub struct SourceDb {
    conn: Connection,
}

impl SourceDb {
    /// Open the source database read-only; ETL must never write to it.
    pub fn open_read_only(path: &str) -> Result<Self> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Highest `message.ROWID` currently present; the ceiling for one sync pass.
    pub fn max_message_rowid(&self) -> Result<i64> {
        let rowid: Option<i64> = self
            .conn
            .query_row("SELECT MAX(ROWID) FROM message", [], |row| row.get(0))?;
        Ok(rowid.unwrap_or(0))
    }
}

#[derive(Debug, Clone)]
pub struct SourceChatRow {
    pub rowid: i64,
    pub chat_identifier: String,
    pub display_name: Option<String>,
    pub room_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceHandleRow {
    pub rowid: i64,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct SourceMessageRow {
    pub rowid: i64,
    pub guid: String,
    pub chat_rowid: i64,
    pub handle_rowid: Option<i64>,
    pub text: Option<String>,
    pub date_apple_ns: i64,
    pub is_from_me: bool,
    pub reply_to_guid: Option<String>,
    pub associated_message_guid: Option<String>,
    pub associated_message_type: i64,
    pub item_type: i64,
    pub group_action_type: i64,
    pub group_title: Option<String>,
    pub service: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SourceAttachmentRow {
    pub guid: String,
    pub message_rowid: i64,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub total_bytes: Option<i64>,
    pub is_sticker: bool,
    pub uti: Option<String>,
}

/// All chats, joined to their primary participant handle for display-name
/// fallback (1:1 chats have no `display_name`, only the other party's handle).
pub fn fetch_chats(source: &SourceDb) -> Result<Vec<SourceChatRow>> {
    let conn = source.conn();
    let mut stmt = conn.prepare(
        "SELECT ROWID, chat_identifier, display_name, room_name FROM chat ORDER BY ROWID",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SourceChatRow {
            rowid: row.get(0)?,
            chat_identifier: row.get(1)?,
            display_name: row.get(2)?,
            room_name: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// `(chat_rowid, handle_rowid)` participant pairs.
pub fn fetch_chat_participants(source: &SourceDb) -> Result<Vec<(i64, i64)>> {
    let conn = source.conn();
    let mut stmt =
        conn.prepare("SELECT chat_id, handle_id FROM chat_handle_join ORDER BY chat_id")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn fetch_handles(source: &SourceDb) -> Result<Vec<SourceHandleRow>> {
    let conn = source.conn();
    let mut stmt = conn.prepare("SELECT ROWID, id FROM handle ORDER BY ROWID")?;
    let rows = stmt.query_map([], |row| {
        Ok(SourceHandleRow {
            rowid: row.get(0)?,
            id: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Messages with `ROWID` in `(since_rowid, max_rowid]`, joined to their chat.
pub fn fetch_messages_since(
    source: &SourceDb,
    since_rowid: i64,
    max_rowid: i64,
) -> Result<Vec<SourceMessageRow>> {
    let conn = source.conn();
    let mut stmt = conn.prepare(
        "SELECT m.ROWID, m.guid, j.chat_id, m.handle_id, m.text, m.date, m.is_from_me,
                m.reply_to_guid, m.associated_message_guid, m.associated_message_type,
                m.item_type, m.group_action_type, m.group_title, m.service
         FROM message m
         JOIN chat_message_join j ON j.message_id = m.ROWID
         WHERE m.ROWID > ?1 AND m.ROWID <= ?2
         ORDER BY m.ROWID",
    )?;
    let rows = stmt.query_map(rusqlite::params![since_rowid, max_rowid], |row| {
        Ok(SourceMessageRow {
            rowid: row.get(0)?,
            guid: row.get(1)?,
            chat_rowid: row.get(2)?,
            handle_rowid: row.get(3)?,
            text: row.get(4)?,
            date_apple_ns: row.get(5)?,
            is_from_me: row.get::<_, i64>(6)? != 0,
            reply_to_guid: row.get(7)?,
            associated_message_guid: row.get(8)?,
            associated_message_type: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
            item_type: row.get::<_, Option<i64>>(10)?.unwrap_or(0),
            group_action_type: row.get::<_, Option<i64>>(11)?.unwrap_or(0),
            group_title: row.get(12)?,
            service: row.get(13)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn fetch_attachments_since(
    source: &SourceDb,
    since_rowid: i64,
    max_rowid: i64,
) -> Result<Vec<SourceAttachmentRow>> {
    let conn = source.conn();
    let mut stmt = conn.prepare(
        "SELECT a.guid, j.message_id, a.filename, a.mime_type, a.total_bytes, a.is_sticker, a.uti
         FROM attachment a
         JOIN chat_message_attachment_join j ON j.attachment_id = a.ROWID
         WHERE j.message_id > ?1 AND j.message_id <= ?2
         ORDER BY a.ROWID",
    )?;
    let rows = stmt.query_map(rusqlite::params![since_rowid, max_rowid], |row| {
        Ok(SourceAttachmentRow {
            guid: row.get(0)?,
            message_rowid: row.get(1)?,
            filename: row.get(2)?,
            mime_type: row.get(3)?,
            total_bytes: row.get(4)?,
            is_sticker: row.get::<_, i64>(5)? != 0,
            uti: row.get(6)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// The trailing 36 characters of a GUID-like string: source rows sometimes
/// prefix `associated_message_guid` with a scheme marker (e.g. `p:0/`); the
/// canonical GUID is always the last 36 characters.
pub fn normalize_guid(raw: &str) -> &str {
    if raw.len() > 36 {
        &raw[raw.len() - 36..]
    } else {
        raw
    }
}
