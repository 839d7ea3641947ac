//! Typed entry points used by the Quill application.
//!
//! Thin pass-throughs to [`RecordRepository`] and [`SettingsStore`]. Reads
//! never fail here: a storage problem is logged and the caller gets an empty
//! list or `None`, so screens render empty instead of breaking. Writes return
//! the underlying error.

use std::cmp::Reverse;
use std::sync::Arc;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::local_db_config::StorageConfig;
use crate::local_db_connection::ConnectionManager;
use crate::local_db_host::StorageHost;
use crate::local_db_model::{Archive, CreativeMapItem, Prompt, PromptType, Todo, Work, WorkType};
use crate::local_db_repository::RecordRepository;
use crate::local_db_reset::ResetManager;
use crate::local_db_schema::{
    SchemaRegistry, ARCHIVES, CREATIVE_MAP_DB, CREATIVE_MAP_ITEMS, MAIN_DB, NAVIGATION, NAVIGATION_DB, PROMPTS,
    TODOS, WORKS,
};
use crate::local_db_settings::SettingsStore;
use crate::store_error::Result;

pub const SETTING_FIRST_VISIT: &str = "hasVisited";
pub const SETTING_LOGGING: &str = "loggingEnabled";

pub struct QuillStore {
    connections: ConnectionManager,
    main: RecordRepository,
    creative_map: RecordRepository,
    navigation: RecordRepository,
    settings: SettingsStore,
}

impl QuillStore {
    pub fn new(connections: ConnectionManager) -> Self {
        Self {
            main: RecordRepository::new(connections.clone(), MAIN_DB),
            creative_map: RecordRepository::new(connections.clone(), CREATIVE_MAP_DB),
            navigation: RecordRepository::new(connections.clone(), NAVIGATION_DB),
            settings: SettingsStore::new(connections.clone()),
            connections,
        }
    }

    /// A store over the application schema, in its own storage host.
    pub fn from_config(config: StorageConfig) -> Self {
        let host = StorageHost::new(config);
        Self::new(ConnectionManager::new(Arc::new(SchemaRegistry::application()), host))
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    // Todos

    pub fn add_todo(&self, todo: &Todo) -> Result<Todo> {
        self.main.add_typed(TODOS, todo)
    }

    /// Newest first.
    pub fn get_all_todos(&self) -> Vec<Todo> {
        let mut todos: Vec<Todo> = read_all(&self.main, TODOS);
        todos.sort_by_key(|t| Reverse(t.created_at));
        todos
    }

    pub fn get_todo(&self, id: i64) -> Option<Todo> {
        read_one(&self.main, TODOS, id)
    }

    pub fn update_todo(&self, todo: &Todo) -> Result<()> {
        self.main.update_typed(TODOS, todo)
    }

    pub fn delete_todo(&self, id: i64) -> Result<()> {
        self.main.remove(TODOS, id)
    }

    pub fn clear_todos(&self) -> Result<()> {
        self.main.clear(TODOS)
    }

    // Works

    pub fn add_work(&self, work: &Work) -> Result<Work> {
        self.main.add_typed(WORKS, work)
    }

    /// Most recently updated first.
    pub fn get_all_works(&self) -> Vec<Work> {
        let mut works: Vec<Work> = read_all(&self.main, WORKS);
        works.sort_by_key(|w| Reverse(w.updated_at));
        works
    }

    pub fn get_work(&self, id: i64) -> Option<Work> {
        read_one(&self.main, WORKS, id)
    }

    pub fn get_works_by_type(&self, work_type: WorkType) -> Vec<Work> {
        let mut works: Vec<Work> = read_indexed(&self.main, WORKS, "type", work_type);
        works.sort_by_key(|w| Reverse(w.updated_at));
        works
    }

    pub fn update_work(&self, work: &Work) -> Result<()> {
        self.main.update_typed(WORKS, work)
    }

    pub fn delete_work(&self, id: i64) -> Result<()> {
        self.main.remove(WORKS, id)
    }

    // Prompts

    pub fn add_prompt(&self, prompt: &Prompt) -> Result<Prompt> {
        self.main.add_typed(PROMPTS, prompt)
    }

    pub fn get_all_prompts(&self) -> Vec<Prompt> {
        let mut prompts: Vec<Prompt> = read_all(&self.main, PROMPTS);
        prompts.sort_by_key(|p| Reverse(p.updated_at));
        prompts
    }

    pub fn get_prompt(&self, id: i64) -> Option<Prompt> {
        read_one(&self.main, PROMPTS, id)
    }

    pub fn get_prompts_by_type(&self, prompt_type: PromptType) -> Vec<Prompt> {
        let mut prompts: Vec<Prompt> = read_indexed(&self.main, PROMPTS, "type", prompt_type);
        prompts.sort_by_key(|p| Reverse(p.updated_at));
        prompts
    }

    pub fn update_prompt(&self, prompt: &Prompt) -> Result<()> {
        self.main.update_typed(PROMPTS, prompt)
    }

    pub fn delete_prompt(&self, id: i64) -> Result<()> {
        self.main.remove(PROMPTS, id)
    }

    // Archives

    pub fn add_archive(&self, archive: &Archive) -> Result<Archive> {
        self.main.add_typed(ARCHIVES, archive)
    }

    pub fn get_all_archives(&self) -> Vec<Archive> {
        let mut archives: Vec<Archive> = read_all(&self.main, ARCHIVES);
        archives.sort_by_key(|a| Reverse(a.updated_at));
        archives
    }

    pub fn get_archive(&self, id: i64) -> Option<Archive> {
        read_one(&self.main, ARCHIVES, id)
    }

    pub fn get_archives_by_category(&self, category: &str) -> Vec<Archive> {
        let mut archives: Vec<Archive> = read_indexed(&self.main, ARCHIVES, "category", category);
        archives.sort_by_key(|a| Reverse(a.updated_at));
        archives
    }

    pub fn get_archives_by_work(&self, work_id: i64) -> Vec<Archive> {
        let mut archives: Vec<Archive> = read_indexed(&self.main, ARCHIVES, "workId", work_id);
        archives.sort_by_key(|a| Reverse(a.updated_at));
        archives
    }

    pub fn update_archive(&self, archive: &Archive) -> Result<()> {
        self.main.update_typed(ARCHIVES, archive)
    }

    pub fn delete_archive(&self, id: i64) -> Result<()> {
        self.main.remove(ARCHIVES, id)
    }

    // Creative map

    pub fn add_creative_map_item(&self, item: &CreativeMapItem) -> Result<CreativeMapItem> {
        self.creative_map.add_typed(CREATIVE_MAP_ITEMS, item)
    }

    pub fn get_all_creative_map_items(&self) -> Vec<CreativeMapItem> {
        let mut items: Vec<CreativeMapItem> = read_all(&self.creative_map, CREATIVE_MAP_ITEMS);
        items.sort_by_key(|i| i.created_at);
        items
    }

    pub fn update_creative_map_item(&self, item: &CreativeMapItem) -> Result<()> {
        self.creative_map.update_typed(CREATIVE_MAP_ITEMS, item)
    }

    pub fn delete_creative_map_item(&self, id: i64) -> Result<()> {
        self.creative_map.remove(CREATIVE_MAP_ITEMS, id)
    }

    pub fn clear_creative_map(&self) -> Result<()> {
        self.creative_map.clear(CREATIVE_MAP_ITEMS)
    }

    // Navigation state

    pub fn save_navigation_state(&self, key: &str, state: &JsonValue) -> Result<()> {
        self.navigation.put_with_key(NAVIGATION, key, state)
    }

    pub fn load_navigation_state(&self, key: &str) -> Option<JsonValue> {
        match self.navigation.get_by_id(NAVIGATION, key) {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to load navigation state '{key}': {e}");
                None
            }
        }
    }

    // Settings

    pub fn is_first_visit(&self) -> bool {
        !self.settings.get(SETTING_FIRST_VISIT, false)
    }

    pub fn mark_visited(&self) -> Result<()> {
        self.settings.set(SETTING_FIRST_VISIT, &true)
    }

    pub fn logging_enabled(&self) -> bool {
        self.settings.get(SETTING_LOGGING, false)
    }

    pub fn set_logging_enabled(&self, enabled: bool) -> Result<()> {
        self.settings.set(SETTING_LOGGING, &enabled)
    }

    /// Deletes every local database. See [`ResetManager::reset_all`].
    pub fn reset_all(&self) -> Result<()> {
        ResetManager::new(self.connections.clone()).reset_all()
    }
}

fn read_all<T: DeserializeOwned>(repository: &RecordRepository, collection: &str) -> Vec<T> {
    match repository.get_all(collection) {
        Ok(records) => decode_records(collection, records),
        Err(e) => {
            warn!("Failed to read '{collection}': {e}");
            Vec::new()
        }
    }
}

fn read_one<T: DeserializeOwned>(repository: &RecordRepository, collection: &str, id: i64) -> Option<T> {
    match repository.get_typed(collection, id) {
        Ok(record) => record,
        Err(e) => {
            warn!("Failed to read {id} from '{collection}': {e}");
            None
        }
    }
}

fn read_indexed<T: DeserializeOwned, V: Serialize>(
    repository: &RecordRepository,
    collection: &str,
    index: &str,
    value: V,
) -> Vec<T> {
    let value = match serde_json::to_value(value) {
        Ok(value) => value,
        Err(e) => {
            warn!("Cannot query '{collection}' by '{index}': {e}");
            return Vec::new();
        }
    };
    match repository.query_by_index(collection, index, &value) {
        Ok(records) => decode_records(collection, records),
        Err(e) => {
            warn!("Failed to query '{collection}' by '{index}': {e}");
            Vec::new()
        }
    }
}

fn decode_records<T: DeserializeOwned>(collection: &str, records: Vec<JsonValue>) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Skipping malformed record in '{collection}': {e}");
                None
            }
        })
        .collect()
}
