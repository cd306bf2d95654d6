use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use parking_lot::RwLock;
use serde_json::Value;

use crate::artifact::{ArtifactCodec, SchemaVersion};
use crate::bundle::{Bundle, HttpVerb, Resource};
use crate::error::ArtifactError;
use crate::model::{Assessment, KnowledgeArtifact};
use crate::repository::{ArtifactRepository, InMemoryRepository};

type ResourceKey = (String, String);

/// Directory of `*.json` resources served through the repository contract.
///
/// Everything is loaded up front; writes go to memory first and are then mirrored to disk, so a failed
/// transaction never touches the files.
pub struct FilesystemRepository {
    dir: PathBuf,
    codec: Box<dyn ArtifactCodec>,
    memory: InMemoryRepository,
    paths: RwLock<HashMap<ResourceKey, PathBuf>>,
}

impl FilesystemRepository {
    pub fn open(dir: impl Into<PathBuf>, schema_version: SchemaVersion) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(ArtifactError::Workspace(format!(
                "artifacts directory {} does not exist",
                dir.display()
            )));
        }
        let repository = Self {
            codec: schema_version.codec(),
            memory: InMemoryRepository::new(),
            paths: RwLock::new(HashMap::new()),
            dir,
        };
        repository.load()?;
        Ok(repository)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Path backing a stored resource, if it has been loaded or written.
    pub fn path_of(&self, resource_type: &str, id: &str) -> Option<PathBuf> {
        self.paths
            .read()
            .get(&(resource_type.to_string(), id.to_string()))
            .cloned()
    }

    fn load(&self) -> Result<(), ArtifactError> {
        let walker = WalkBuilder::new(&self.dir)
            .hidden(true)
            .ignore(true)
            .git_ignore(true)
            .require_git(false)
            .build();

        let mut loaded = 0usize;
        for result in walker {
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable workspace entry");
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let resource = self
                .read_file(path)
                .map_err(|err| err.context(path.display()))?;
            let Some(resource) = resource else {
                tracing::debug!(path = %path.display(), "not an artifact, skipped");
                continue;
            };
            let stored = self
                .memory
                .create(resource)
                .map_err(|err| err.context(path.display()))?;
            self.paths.write().insert(key_of(&stored)?, path.to_path_buf());
            loaded += 1;
        }
        tracing::debug!(dir = %self.dir.display(), loaded, "loaded artifact workspace");
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<Option<Resource>, ArtifactError> {
        let raw = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&raw)?;
        let resource_type = value
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match resource_type {
            "" | "Bundle" | "Parameters" | "OperationOutcome" => Ok(None),
            "Basic" | "ArtifactAssessment" => {
                let assessment: Assessment = serde_json::from_value(value)?;
                Ok(Some(Resource::Assessment(assessment)))
            }
            _ if value.get("url").is_none() => Ok(None),
            _ => Ok(Some(Resource::Artifact(self.codec.decode(value)?))),
        }
    }

    fn encode(&self, resource: &Resource) -> Result<Value, ArtifactError> {
        match resource {
            Resource::Artifact(artifact) => self.codec.encode(artifact),
            Resource::Assessment(assessment) => self.codec.encode_assessment(assessment),
        }
    }

    fn write(&self, resource: &Resource) -> Result<PathBuf, ArtifactError> {
        let key = key_of(resource)?;
        let path = self
            .path_of(&key.0, &key.1)
            .unwrap_or_else(|| self.dir.join(format!("{}-{}.json", key.0, key.1)));
        let mut body = serde_json::to_string_pretty(&self.encode(resource)?)?;
        body.push('\n');
        fs::write(&path, body)?;
        self.paths.write().insert(key, path.clone());
        Ok(path)
    }

    fn remove(&self, resource_type: &str, id: &str) -> Result<(), ArtifactError> {
        let key = (resource_type.to_string(), id.to_string());
        let path = self
            .paths
            .write()
            .remove(&key)
            .unwrap_or_else(|| self.dir.join(format!("{resource_type}-{id}.json")));
        if path.is_file() {
            fs::remove_file(&path)?;
            tracing::debug!(path = %path.display(), "removed artifact file");
        }
        Ok(())
    }
}

fn key_of(resource: &Resource) -> Result<ResourceKey, ArtifactError> {
    let id = resource
        .id()
        .ok_or_else(|| ArtifactError::Validation("resource has no id".into()))?;
    Ok((resource.resource_type().to_string(), id.to_string()))
}

impl ArtifactRepository for FilesystemRepository {
    fn read_by_id(&self, resource_type: &str, id: &str) -> Result<Option<Resource>, ArtifactError> {
        self.memory.read_by_id(resource_type, id)
    }

    fn search(&self, url: &str) -> Result<Vec<KnowledgeArtifact>, ArtifactError> {
        self.memory.search(url)
    }

    fn create(&self, resource: Resource) -> Result<Resource, ArtifactError> {
        let created = self.memory.create(resource)?;
        self.write(&created)?;
        Ok(created)
    }

    fn update(&self, resource: Resource) -> Result<Resource, ArtifactError> {
        let updated = self.memory.update(resource)?;
        self.write(&updated)?;
        Ok(updated)
    }

    fn delete(&self, resource_type: &str, id: &str) -> Result<(), ArtifactError> {
        self.memory.delete(resource_type, id)?;
        self.remove(resource_type, id)
    }

    fn transaction(&self, bundle: &Bundle) -> Result<Bundle, ArtifactError> {
        let response = self.memory.transaction(bundle)?;
        for (request, result) in bundle.entry.iter().zip(&response.entry) {
            let Some(method) = request.request.as_ref().map(|r| r.method) else {
                continue;
            };
            match (method, &result.resource) {
                (HttpVerb::Delete, _) => {
                    if let Some((resource_type, id)) = request
                        .request
                        .as_ref()
                        .and_then(|r| r.url.split_once('/'))
                    {
                        self.remove(resource_type, id)?;
                    }
                }
                (_, Some(resource)) => {
                    self.write(resource)?;
                }
                (_, None) => {}
            }
        }
        tracing::info!(
            dir = %self.dir.display(),
            entries = response.entry.len(),
            "persisted transaction"
        );
        Ok(response)
    }
}
