use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub name: Option<String>,
    pub nickname: Option<String>,
    pub is_me: bool,
    pub data_source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentifierType {
    Phone,
    Email,
}

impl IdentifierType {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierType::Phone => "phone",
            IdentifierType::Email => "email",
        }
    }

    /// Phone identifiers are `+`-prefixed or all-digit; anything containing
    /// `@` is an email. Matches how the source's `handle.id` column encodes both.
    pub fn classify(identifier: &str) -> Self {
        if identifier.contains('@') {
            IdentifierType::Email
        } else {
            IdentifierType::Phone
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    pub chat_identifier: String,
    pub chat_name: Option<String>,
    pub is_group: bool,
    pub created_date: Option<i64>,
    pub last_message_date: Option<i64>,
    pub total_messages: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub guid: String,
    pub chat_id: i64,
    pub sender_id: Option<i64>,
    pub content: Option<String>,
    pub timestamp: i64,
    pub is_from_me: bool,
    pub reply_to_guid: Option<String>,
    pub associated_message_guid: Option<String>,
    pub message_type: String,
    pub service_name: Option<String>,
    pub conversation_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub guid: String,
    pub message_id: i64,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<i64>,
    pub is_sticker: bool,
    pub uti: Option<String>,
}

/// Legacy and modern tapback kinds, normalized to the 2000-2005 integer
/// range used by the source's legacy `associated_message_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionType {
    Loved = 2000,
    Liked = 2001,
    Disliked = 2002,
    Laughed = 2003,
    Emphasized = 2004,
    Questioned = 2005,
}

impl ReactionType {
    pub fn from_legacy_code(code: i64) -> Option<Self> {
        match code {
            2000 => Some(ReactionType::Loved),
            2001 => Some(ReactionType::Liked),
            2002 => Some(ReactionType::Disliked),
            2003 => Some(ReactionType::Laughed),
            2004 => Some(ReactionType::Emphasized),
            2005 => Some(ReactionType::Questioned),
            _ => None,
        }
    }

    /// Modern rows prefix the associated-message text with a human label
    /// instead of encoding a legacy integer type.
    pub fn from_text_prefix(text: &str) -> Option<Self> {
        const PREFIXES: &[(&str, ReactionType)] = &[
            ("Loved ", ReactionType::Loved),
            ("Liked ", ReactionType::Liked),
            ("Disliked ", ReactionType::Disliked),
            ("Laughed at ", ReactionType::Laughed),
            ("Emphasized ", ReactionType::Emphasized),
            ("Questioned ", ReactionType::Questioned),
        ];
        PREFIXES
            .iter()
            .find(|(prefix, _)| text.starts_with(prefix))
            .map(|(_, kind)| *kind)
    }

    pub fn as_code(self) -> i64 {
        self as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub guid: String,
    pub original_message_guid: String,
    pub timestamp: i64,
    pub sender_id: Option<i64>,
    pub chat_id: i64,
    pub reaction_type: i64,
    pub is_from_me: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipAction {
    Added,
    Removed,
    Renamed,
}

impl MembershipAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MembershipAction::Added => "added",
            MembershipAction::Removed => "removed",
            MembershipAction::Renamed => "renamed",
        }
    }

    /// The source's `group_action_type` column: `1` marks a participant
    /// leaving, `3` marks a participant joining; any other non-zero value
    /// is a display-name change (the only other group action it emits).
    pub fn from_group_action_type(code: i64) -> Self {
        match code {
            1 => MembershipAction::Removed,
            3 => MembershipAction::Added,
            _ => MembershipAction::Renamed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub guid: String,
    pub chat_id: i64,
    pub actor_id: Option<i64>,
    pub member_id: Option<i64>,
    pub action_type: MembershipAction,
    pub item_type: Option<i64>,
    pub message_action_type: Option<i64>,
    pub group_title: Option<String>,
    pub timestamp: i64,
    pub is_from_me: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub chat_id: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub message_count: i64,
    pub initiator_id: Option<i64>,
    pub gap_threshold: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Blocked,
    Dead,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Running => "running",
            AnalysisStatus::Succeeded => "succeeded",
            AnalysisStatus::Failed => "failed",
            AnalysisStatus::Blocked => "blocked",
            AnalysisStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationAnalysis {
    pub id: i64,
    pub conversation_id: i64,
    pub prompt_template_id: String,
    pub status: AnalysisStatus,
    pub eve_prompt_id: Option<String>,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub blocked_reason: Option<String>,
    pub blocked_reason_message: Option<String>,
    pub blocked_at: Option<i64>,
    pub completion_id: Option<i64>,
}

/// One of the four facet tables (`entities`, `topics`, `emotions`,
/// `humor_items`), which share an identical shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FacetKind {
    Entity,
    Topic,
    Emotion,
    HumorItem,
}

impl FacetKind {
    pub fn table_name(self) -> &'static str {
        match self {
            FacetKind::Entity => "entities",
            FacetKind::Topic => "topics",
            FacetKind::Emotion => "emotions",
            FacetKind::HumorItem => "humor_items",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacetRow {
    pub conversation_id: i64,
    pub chat_id: i64,
    pub contact_id: Option<i64>,
    pub item_value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub conversation_id: i64,
    pub chat_id: i64,
    pub prompt_template_id: String,
    pub compiled_prompt_text: String,
    pub model: String,
    pub result: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub entity_type: String,
    pub entity_id: i64,
    pub model: String,
    pub embedding_blob: Vec<u8>,
    pub dimension: i64,
    pub created_at: i64,
}
