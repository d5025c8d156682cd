//! Logical collection names.
//!
//! Every repository, adapter mapping and search configuration keys off these
//! names; the relational adapter checks at startup that each one is mapped.

pub const USERS: &str = "users";
pub const CONVERSATIONS: &str = "conversations";
pub const MESSAGES: &str = "messages";
pub const KNOWLEDGE_BASES: &str = "knowledge_bases";
pub const DOCUMENTS: &str = "documents";
pub const AGENTS: &str = "agents";
pub const TOOLS: &str = "tools";
pub const API_KEYS: &str = "api_keys";
pub const SESSIONS: &str = "sessions";
pub const SETTINGS: &str = "settings";
pub const USAGE_LOGS: &str = "usage_logs";
pub const FEEDBACK: &str = "feedback";
pub const FILES: &str = "files";
pub const NOTIFICATIONS: &str = "notifications";
pub const AUDIT_LOGS: &str = "audit_logs";

/// All known collections, in registration order
pub const ALL: &[&str] = &[
    USERS,
    CONVERSATIONS,
    MESSAGES,
    KNOWLEDGE_BASES,
    DOCUMENTS,
    AGENTS,
    TOOLS,
    API_KEYS,
    SESSIONS,
    SETTINGS,
    USAGE_LOGS,
    FEEDBACK,
    FILES,
    NOTIFICATIONS,
    AUDIT_LOGS,
];

pub fn is_known(name: &str) -> bool {
    ALL.contains(&name)
}
