//! Conversation context assembly: the piece of analysis that turns a
//! conversation id into the transcript text handed to the prompt compiler.

use std::sync::Arc;

use eve_warehouse::{query, Writer};

use crate::error::Result;

/// The conversation-scoped facts a prompt needs: which chat it belongs to,
/// and its encoded transcript.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub chat_id: i64,
    pub text: String,
}

/// Assembles conversation context for a prompt — read from the warehouse in
/// production, from memory in tests.
pub trait ContextAssembler: Send + Sync {
    fn assemble(&self, conversation_id: i64, max_messages: usize) -> Result<ConversationContext>;
}

/// Reads conversation metadata and transcript straight from the warehouse.
pub struct WarehouseContextAssembler {
    writer: Arc<Writer>,
}

impl WarehouseContextAssembler {
    pub fn new(writer: Arc<Writer>) -> Self {
        Self { writer }
    }
}

impl ContextAssembler for WarehouseContextAssembler {
    fn assemble(&self, conversation_id: i64, max_messages: usize) -> Result<ConversationContext> {
        let conversation = query::load_conversation(&self.writer, conversation_id)?;
        let text = query::load_conversation_text(&self.writer, conversation_id, max_messages)?;
        Ok(ConversationContext { chat_id: conversation.chat_id, text })
    }
}

/// In-memory [`ContextAssembler`] for tests, avoiding a warehouse fixture.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct StaticContextAssembler {
        contexts: Mutex<HashMap<i64, ConversationContext>>,
    }

    impl StaticContextAssembler {
        pub fn new(contexts: Vec<(i64, ConversationContext)>) -> Self {
            Self { contexts: Mutex::new(contexts.into_iter().collect()) }
        }
    }

    impl ContextAssembler for StaticContextAssembler {
        fn assemble(&self, conversation_id: i64, _max_messages: usize) -> Result<ConversationContext> {
            Ok(self
                .contexts
                .lock()
                .unwrap()
                .get(&conversation_id)
                .unwrap_or_else(|| panic!("no fixture context seeded for conversation {conversation_id}"))
                .clone())
        }
    }
}
