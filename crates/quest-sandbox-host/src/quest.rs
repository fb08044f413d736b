//! The quest book: host-side state behind the `quest.*` capabilities.

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use quest_sandbox_common::CapabilityError;

/// Progress of a registered task.
///
/// Mirrors the `status` enum of `component:quest-v1/engine-types`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CapabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CapabilityError::InvalidArgs(format!("unknown task status '{s}'")))
    }
}

/// A task registered by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub quest_id: String,
    pub task_id: String,
    pub description: String,
    pub status: TaskStatus,
    /// The instance that registered it.
    pub instance_id: String,
}

/// A visitable item registered by an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub url: String,
    pub title: String,
    pub kind: String,
    pub instance_id: String,
}

/// A message shown to the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub instance_id: String,
    pub message: String,
}

/// Tasks, items and notifications recorded for the player.
#[derive(Debug)]
pub struct QuestBook {
    tasks: DashMap<(String, String), Task>,
    items: DashMap<String, Item>,
    notifications: Mutex<Vec<Notification>>,
    current_url: RwLock<String>,
}

impl QuestBook {
    /// Create an empty book whose current URL is `start_url`.
    pub fn new(start_url: impl Into<String>) -> Self {
        Self {
            tasks: DashMap::new(),
            items: DashMap::new(),
            notifications: Mutex::new(Vec::new()),
            current_url: RwLock::new(start_url.into()),
        }
    }

    /// Register a task as pending.
    ///
    /// Registering an existing task replaces its description and keeps its
    /// status.
    pub fn register_task(&self, instance_id: &str, quest_id: &str, task_id: &str, description: &str) {
        let key = (quest_id.to_string(), task_id.to_string());
        let mut entry = self.tasks.entry(key).or_insert_with(|| Task {
            quest_id: quest_id.to_string(),
            task_id: task_id.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            instance_id: instance_id.to_string(),
        });
        entry.description = description.to_string();
        entry.instance_id = instance_id.to_string();
        info!(instance_id, quest_id, task_id, "Task registered");
    }

    /// Set the status of a registered task.
    ///
    /// # Errors
    ///
    /// `not-found` if the task was never registered.
    pub fn update_task(
        &self,
        quest_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), CapabilityError> {
        let key = (quest_id.to_string(), task_id.to_string());
        let mut task = self.tasks.get_mut(&key).ok_or_else(|| {
            CapabilityError::NotFound(format!("task {quest_id}/{task_id}"))
        })?;
        task.status = status;
        info!(quest_id, task_id, status = %status, "Task updated");
        Ok(())
    }

    pub fn notify(&self, instance_id: &str, message: &str) {
        info!(instance_id, "Player notified: {}", message);
        self.notifications.lock().push(Notification {
            instance_id: instance_id.to_string(),
            message: message.to_string(),
        });
    }

    /// Register (or replace) a visitable item.
    pub fn register_item(&self, instance_id: &str, id: &str, url: &str, title: &str, kind: &str) {
        self.items.insert(
            id.to_string(),
            Item {
                id: id.to_string(),
                url: url.to_string(),
                title: title.to_string(),
                kind: kind.to_string(),
                instance_id: instance_id.to_string(),
            },
        );
        debug!(instance_id, id, url, "Item registered");
    }

    pub fn current_url(&self) -> String {
        self.current_url.read().clone()
    }

    /// Record a navigation.
    pub fn set_current_url(&self, url: impl Into<String>) {
        *self.current_url.write() = url.into();
    }

    pub fn task(&self, quest_id: &str, task_id: &str) -> Option<Task> {
        self.tasks
            .get(&(quest_id.to_string(), task_id.to_string()))
            .map(|t| t.clone())
    }

    /// Every task, sorted by quest then task id.
    pub fn tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|t| t.value().clone()).collect();
        tasks.sort_by(|a, b| (&a.quest_id, &a.task_id).cmp(&(&b.quest_id, &b.task_id)));
        tasks
    }

    /// Every item, sorted by id.
    pub fn items(&self) -> Vec<Item> {
        let mut items: Vec<Item> = self.items.iter().map(|i| i.value().clone()).collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.lock().clone()
    }
}

impl Default for QuestBook {
    fn default() -> Self {
        Self::new("about:blank")
    }
}
