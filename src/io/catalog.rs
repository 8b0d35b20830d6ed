use crate::types::{CloudlessError, CloudlessResult, MosaicDescriptor, SceneRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Scene search parameters understood by every catalog
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    pub tile: Option<String>,
    pub from: NaiveDate,   // inclusive
    pub to: NaiveDate,     // inclusive
    pub min_cloud: f64,
    pub max_cloud: f64,
}

impl CatalogQuery {
    pub fn matches(&self, scene: &SceneRecord) -> bool {
        let date = scene.acquisition_date();
        let tile_ok = self
            .tile
            .as_deref()
            .map_or(true, |tile| scene.grid.tile_id == tile);
        tile_ok
            && date >= self.from
            && date <= self.to
            && scene.cloud_cover >= self.min_cloud
            && scene.cloud_cover <= self.max_cloud
    }
}

/// Scene index consulted by the selector and updated by the writer
pub trait SceneCatalog: Send + Sync {
    /// Scenes matching `query`, in no particular order
    fn query(&self, query: &CatalogQuery) -> CloudlessResult<Vec<SceneRecord>>;

    /// Index a written mosaic. Re-registering an identical id and URI is not
    /// an error and reports `AlreadyPresent`.
    fn register(&self, descriptor: &MosaicDescriptor) -> CloudlessResult<Registration>;
}

/// Result of a successful `SceneCatalog::register`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    AlreadyPresent,
}

fn existing_registration(mosaics: &[MosaicDescriptor], descriptor: &MosaicDescriptor) -> CloudlessResult<bool> {
    match mosaics.iter().find(|m| m.id == descriptor.id) {
        None => Ok(false),
        Some(existing) if existing.uri == descriptor.uri => Ok(true),
        Some(existing) => Err(CloudlessError::Catalog(format!(
            "mosaic id {} already registered for {}, refusing {}",
            descriptor.id, existing.uri, descriptor.uri
        ))),
    }
}

/// Catalog held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    scenes: RwLock<Vec<SceneRecord>>,
    mosaics: Mutex<Vec<MosaicDescriptor>>,
}

impl InMemoryCatalog {
    pub fn new(scenes: Vec<SceneRecord>) -> Self {
        Self {
            scenes: RwLock::new(scenes),
            mosaics: Mutex::new(Vec::new()),
        }
    }

    pub fn add_scene(&self, scene: SceneRecord) {
        self.scenes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(scene);
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Mosaics registered so far, in registration order
    pub fn mosaics(&self) -> Vec<MosaicDescriptor> {
        self.mosaics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn scenes_snapshot(&self) -> Vec<SceneRecord> {
        self.scenes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl SceneCatalog for InMemoryCatalog {
    fn query(&self, query: &CatalogQuery) -> CloudlessResult<Vec<SceneRecord>> {
        let scenes = self.scenes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(scenes.iter().filter(|s| query.matches(s)).cloned().collect())
    }

    fn register(&self, descriptor: &MosaicDescriptor) -> CloudlessResult<Registration> {
        let mut mosaics = self.mosaics.lock().unwrap_or_else(PoisonError::into_inner);
        if existing_registration(&mosaics, descriptor)? {
            log::info!("Mosaic {} already registered ({})", descriptor.id, descriptor.uri);
            return Ok(Registration::AlreadyPresent);
        }
        log::debug!("Registered mosaic {} -> {}", descriptor.id, descriptor.uri);
        mosaics.push(descriptor.clone());
        Ok(Registration::Added)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    scenes: Vec<SceneRecord>,
    #[serde(default)]
    mosaics: Vec<MosaicDescriptor>,
}

/// Catalog persisted as a single JSON document
///
/// Registrations are written back to disk immediately via a temporary file
/// and rename, so a crash never leaves a truncated document behind.
#[derive(Debug)]
pub struct JsonCatalog {
    path: PathBuf,
    inner: InMemoryCatalog,
    persist_lock: Mutex<()>,
}

impl JsonCatalog {
    /// Open an existing catalog document, or start an empty one at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> CloudlessResult<Self> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str::<CatalogDocument>(&text)?
        } else {
            log::info!("Catalog {} does not exist yet, starting empty", path.display());
            CatalogDocument::default()
        };
        log::info!(
            "Opened catalog {} with {} scenes and {} mosaics",
            path.display(),
            document.scenes.len(),
            document.mosaics.len()
        );

        let inner = InMemoryCatalog::new(document.scenes);
        *inner.mosaics.lock().unwrap_or_else(PoisonError::into_inner) = document.mosaics;
        Ok(Self {
            path,
            inner,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mosaics(&self) -> Vec<MosaicDescriptor> {
        self.inner.mosaics()
    }

    /// Add a scene and persist the document
    pub fn add_scene(&self, scene: SceneRecord) -> CloudlessResult<()> {
        self.inner.add_scene(scene);
        self.persist()
    }

    fn persist(&self) -> CloudlessResult<()> {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write_document(&CatalogDocument {
            scenes: self.inner.scenes_snapshot(),
            mosaics: self.inner.mosaics(),
        })
    }

    /// Caller holds `persist_lock`
    fn write_document(&self, document: &CatalogDocument) -> CloudlessResult<()> {
        let text = serde_json::to_string_pretty(document)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let partial = self.path.with_extension("json.partial");
        std::fs::write(&partial, text)?;
        std::fs::rename(&partial, &self.path)?;
        Ok(())
    }
}

impl SceneCatalog for JsonCatalog {
    fn query(&self, query: &CatalogQuery) -> CloudlessResult<Vec<SceneRecord>> {
        self.inner.query(query)
    }

    /// The document on disk is updated before the in-memory index, so a
    /// failed write leaves both without the descriptor.
    fn register(&self, descriptor: &MosaicDescriptor) -> CloudlessResult<Registration> {
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut mosaics = self.inner.mosaics();
        if existing_registration(&mosaics, descriptor)? {
            return self.inner.register(descriptor);
        }
        mosaics.push(descriptor.clone());
        self.write_document(&CatalogDocument {
            scenes: self.inner.scenes_snapshot(),
            mosaics,
        })?;
        self.inner.register(descriptor)
    }
}

/// Serializes catalog registration per destination key
///
/// Units writing to different keys register concurrently; a second
/// registration for a key that already succeeded is suppressed.
#[derive(Debug, Default)]
pub struct RegistrationGate {
    keys: Mutex<HashMap<String, Arc<Mutex<bool>>>>,
}

impl RegistrationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor` under `key` unless that key was already registered.
    /// Returns whether this call added the descriptor to the catalog.
    pub fn register_once(
        &self,
        catalog: &dyn SceneCatalog,
        key: &str,
        descriptor: &MosaicDescriptor,
    ) -> CloudlessResult<bool> {
        let slot = {
            let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(keys.entry(key.to_string()).or_default())
        };

        let mut registered = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *registered {
            log::debug!("Destination {} already registered, skipping", key);
            return Ok(false);
        }
        let outcome = catalog.register(descriptor)?;
        *registered = true;
        Ok(outcome == Registration::Added)
    }
}
