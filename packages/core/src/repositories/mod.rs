//! Repositories
//!
//! Typed CRUD facades over the logical collections. [`Repository`] carries the
//! shared validate → transform → adapter pipeline; each domain repository
//! wraps one, adds its [`RecordPolicy`] and exposes domain queries. Domain
//! repositories deref to [`Repository`], so the generic contract is always
//! available.

mod agents;
mod api_keys;
mod audit_logs;
mod base;
mod conversations;
mod documents;
mod error;
mod feedback;
mod files;
mod knowledge_bases;
mod messages;
mod notifications;
mod sessions;
mod settings;
mod tools;
mod usage_logs;
mod users;

pub use agents::AgentRepository;
pub use api_keys::ApiKeyRepository;
pub use audit_logs::{AuditEvent, AuditLogRepository};
pub use base::{DefaultPolicy, FindOrCreate, RecordPolicy, Repository, WriteOperation};
pub use conversations::ConversationRepository;
pub use documents::{
    DocumentRepository, STATUS_FAILED, STATUS_PENDING, STATUS_PROCESSING, STATUS_READY,
};
pub use error::{RepositoryError, RepositoryResult};
pub use feedback::{FeedbackRepository, RatingSummary, MAX_RATING, MIN_RATING};
pub use files::FileRepository;
pub use knowledge_bases::KnowledgeBaseRepository;
pub use messages::MessageRepository;
pub use notifications::NotificationRepository;
pub use sessions::SessionRepository;
pub use settings::SettingsRepository;
pub use tools::ToolRepository;
pub use usage_logs::{ModelUsage, UsageEntry, UsageLogRepository, UsageTotals};
pub use users::UserRepository;

use crate::db::StoreAdapter;
use crate::models::collections;
use crate::search::SearchIndexer;
use std::sync::Arc;

/// Registered repository names, one per logical collection
pub const REPOSITORY_NAMES: &[&str] = collections::ALL;

/// Every domain repository over one adapter
#[derive(Clone, Debug)]
pub struct Repositories {
    pub users: UserRepository,
    pub conversations: ConversationRepository,
    pub messages: MessageRepository,
    pub knowledge_bases: KnowledgeBaseRepository,
    pub documents: DocumentRepository,
    pub agents: AgentRepository,
    pub tools: ToolRepository,
    pub api_keys: ApiKeyRepository,
    pub sessions: SessionRepository,
    pub settings: SettingsRepository,
    pub usage_logs: UsageLogRepository,
    pub feedback: FeedbackRepository,
    pub files: FileRepository,
    pub notifications: NotificationRepository,
    pub audit_logs: AuditLogRepository,
}

impl Repositories {
    pub fn new(store: Arc<dyn StoreAdapter>, indexer: SearchIndexer) -> Self {
        Self {
            users: UserRepository::new(store.clone()),
            conversations: ConversationRepository::new(store.clone(), indexer.clone()),
            messages: MessageRepository::new(store.clone(), indexer.clone()),
            knowledge_bases: KnowledgeBaseRepository::new(store.clone()),
            documents: DocumentRepository::new(store.clone(), indexer),
            agents: AgentRepository::new(store.clone()),
            tools: ToolRepository::new(store.clone()),
            api_keys: ApiKeyRepository::new(store.clone()),
            sessions: SessionRepository::new(store.clone()),
            settings: SettingsRepository::new(store.clone()),
            usage_logs: UsageLogRepository::new(store.clone()),
            feedback: FeedbackRepository::new(store.clone()),
            files: FileRepository::new(store.clone()),
            notifications: NotificationRepository::new(store.clone()),
            audit_logs: AuditLogRepository::new(store),
        }
    }

    /// Generic view of a repository by collection name
    pub fn get(&self, name: &str) -> Option<&Repository> {
        let repo: &Repository = match name {
            collections::USERS => &*self.users,
            collections::CONVERSATIONS => &*self.conversations,
            collections::MESSAGES => &*self.messages,
            collections::KNOWLEDGE_BASES => &*self.knowledge_bases,
            collections::DOCUMENTS => &*self.documents,
            collections::AGENTS => &*self.agents,
            collections::TOOLS => &*self.tools,
            collections::API_KEYS => &*self.api_keys,
            collections::SESSIONS => &*self.sessions,
            collections::SETTINGS => &*self.settings,
            collections::USAGE_LOGS => &*self.usage_logs,
            collections::FEEDBACK => &*self.feedback,
            collections::FILES => &*self.files,
            collections::NOTIFICATIONS => &*self.notifications,
            collections::AUDIT_LOGS => &*self.audit_logs,
            _ => return None,
        };
        Some(repo)
    }

    /// All repositories in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Repository> {
        REPOSITORY_NAMES.iter().filter_map(|name| self.get(name))
    }

    /// Repositories that mirror writes into the search index
    pub fn search_integrated(&self) -> impl Iterator<Item = &Repository> {
        self.iter().filter(|repo| repo.is_search_integrated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{LibsqlConfig, LibsqlStore};

    #[tokio::test]
    async fn test_every_name_resolves() -> anyhow::Result<()> {
        let store: Arc<dyn StoreAdapter> = Arc::new(LibsqlStore::new(LibsqlConfig::in_memory())?);
        let repos = Repositories::new(store.clone(), SearchIndexer::disabled(store));

        for name in REPOSITORY_NAMES {
            assert_eq!(repos.get(name).map(Repository::collection), Some(*name));
        }
        assert!(repos.get("widgets").is_none());

        let searchable: Vec<_> = repos.search_integrated().map(Repository::collection).collect();
        assert_eq!(
            searchable,
            vec![collections::CONVERSATIONS, collections::MESSAGES, collections::DOCUMENTS]
        );
        Ok(())
    }
}
