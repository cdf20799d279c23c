//! Project lookup and configuration resolution against the OpenSPG service.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::errors::ProjectError;
use crate::util::is_numeric_id;

const PROJECT_LIST_PATH: &str = "/public/v1/project";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One project as returned by the project service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectRecord {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    /// JSON document, serialized as a string.
    #[serde(default)]
    pub config: Option<String>,
}

fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "project id must be a string or number, got {}",
            other
        ))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ProjectListBody {
    Bare(Vec<ProjectRecord>),
    Wrapped { result: Vec<ProjectRecord> },
}

/// Source of project records and their configuration.
#[async_trait]
pub trait ProjectClient: Send + Sync {
    /// Address recorded into synthesized `project` sections.
    fn host_addr(&self) -> &str;

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, ProjectError>;

    async fn get_project(&self, id: &str) -> Result<Option<ProjectRecord>, ProjectError> {
        Ok(self.list_projects().await?.into_iter().find(|p| p.id == id))
    }

    /// Normalized configuration for `id`; unknown projects yield an empty config.
    async fn load_config(&self, id: &str) -> Result<ProjectConfig, ProjectError> {
        match self.get_project(id).await? {
            Some(record) => ProjectConfig::from_record(&record, self.host_addr()),
            None => {
                tracing::warn!(project_id = %id, "Project not found; using empty config");
                Ok(ProjectConfig::default())
            }
        }
    }
}

pub struct OpenSpgProjectClient {
    client: reqwest::Client,
    host_addr: String,
}

impl OpenSpgProjectClient {
    pub fn new(host_addr: impl Into<String>) -> Result<Self, ProjectError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ProjectError::Request)?;
        Ok(Self {
            client,
            host_addr: host_addr.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProjectClient for OpenSpgProjectClient {
    fn host_addr(&self) -> &str {
        &self.host_addr
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, ProjectError> {
        let url = format!("{}{}", self.host_addr, PROJECT_LIST_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ProjectError::Request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProjectError::Status {
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(ProjectError::Request)?;
        let list: ProjectListBody =
            serde_json::from_slice(&body).map_err(|e| ProjectError::Decode(e.to_string()))?;
        Ok(match list {
            ProjectListBody::Bare(records) => records,
            ProjectListBody::Wrapped { result } => result,
        })
    }
}

/// A project's configuration document after normalization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectConfig {
    root: Map<String, Value>,
}

impl ProjectConfig {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            _ => Self::default(),
        }
    }

    /// Parse and normalize a project record's config string.
    ///
    /// A missing `project` section is synthesized from the record, taking
    /// `language` and `biz_scene` from the `prompt` section (which is
    /// removed). `vectorizer` is mirrored to `vectorize_model` when the
    /// latter is absent.
    pub fn from_record(record: &ProjectRecord, host_addr: &str) -> Result<Self, ProjectError> {
        let raw = record.config.as_deref().unwrap_or("").trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let parsed: Value = serde_json::from_str(raw).map_err(|source| ProjectError::InvalidConfig {
            project_id: record.id.clone(),
            source,
        })?;
        let Value::Object(mut root) = parsed else {
            tracing::warn!(project_id = %record.id, "Project config is not a JSON object; ignoring");
            return Ok(Self::default());
        };

        if !root.contains_key("project") {
            let mut project = Map::new();
            project.insert("id".into(), Value::String(record.id.clone()));
            project.insert("host_addr".into(), Value::String(host_addr.to_string()));
            project.insert(
                "namespace".into(),
                record.namespace.clone().map(Value::String).unwrap_or(Value::Null),
            );
            if let Some(Value::Object(prompt)) = root.remove("prompt") {
                for key in ["language", "biz_scene"] {
                    if let Some(value) = prompt.get(key) {
                        project.insert(key.into(), value.clone());
                    }
                }
            }
            root.insert("project".into(), Value::Object(project));
        }

        if !root.contains_key("vectorize_model")
            && let Some(vectorizer) = root.get("vectorizer").cloned()
        {
            root.insert("vectorize_model".into(), vectorizer);
        }

        Ok(Self { root })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// The pipeline definition, unless absent or empty.
    pub fn solver_pipeline(&self) -> Option<&Value> {
        self.root.get("solver_pipeline").filter(|v| match v {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            _ => true,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.root.clone())
    }
}

/// Name → numeric id mapping, shared read-mostly across sessions.
///
/// Refresh builds a complete new map and swaps the `Arc`, so readers
/// always see either the old or the new mapping in full.
#[derive(Default)]
pub struct ProjectCatalog {
    names: RwLock<Arc<HashMap<String, String>>>,
}

impl ProjectCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(names: HashMap<String, String>) -> Self {
        Self {
            names: RwLock::new(Arc::new(names)),
        }
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, names: HashMap<String, String>) {
        *self.names.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(names);
    }

    /// Reload from the project service. On failure the current mapping is kept.
    pub async fn refresh(&self, client: &dyn ProjectClient) -> Result<usize, ProjectError> {
        let records = client.list_projects().await?;
        let names: HashMap<String, String> = records
            .into_iter()
            .map(|record| (record.name, record.id))
            .collect();
        let count = names.len();
        for (name, id) in &names {
            tracing::debug!(project = %name, id = %id, "Catalog entry");
        }
        self.replace(names);
        tracing::info!(count, "Loaded project catalog");
        Ok(count)
    }

    /// Numeric keys pass through; known names map to their id; anything else
    /// is returned unchanged.
    pub fn resolve(&self, key: &str) -> String {
        if is_numeric_id(key) {
            return key.to_string();
        }
        match self.snapshot().get(key) {
            Some(id) => {
                tracing::info!(project = %key, id = %id, "Resolved project name to id");
                id.clone()
            }
            None => key.to_string(),
        }
    }

    /// Project names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
