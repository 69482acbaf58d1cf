use std::{collections::BTreeMap, fmt, path::Path, str::FromStr, sync::Arc};

use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::{
    backend::{from_addr, StoreBackend},
    events::DEFAULT_QUEUE_CAPACITY,
    handle::NodeHandle,
    listenable::ListenableStore,
    node::validate_name,
    pseudoclass::{NodeView, PseudoClassRegistry},
    Error,
};

/// A path into a mounted drive, written as `drive:/a/b/c`.
/// `drive:` and `drive:/` both denote the root of the drive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AfsPath {
    drive: String,
    components: Vec<String>,
}

impl AfsPath {
    pub fn new(drive: String, components: Vec<String>) -> Self {
        Self { drive, components }
    }

    pub fn drive(&self) -> &str {
        &self.drive
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }
}

impl FromStr for AfsPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (drive, rest) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidRequest(format!("{} lacks a drive name", s)))?;
        validate_name(drive)?;

        let components = match rest {
            "" => Vec::new(),
            rest => rest
                .strip_prefix('/')
                .ok_or_else(|| Error::InvalidRequest(format!("{} isn't absolute", s)))?
                .split('/')
                .filter(|c| !c.is_empty())
                .map(|c| validate_name(c).map(|_| c.to_string()))
                .collect::<Result<_, _>>()?,
        };

        Ok(Self::new(drive.to_string(), components))
    }
}

impl fmt::Display for AfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:/{}", self.drive, self.components.join("/"))
    }
}

/// Describes which drives to mount, usually read from a TOML file:
///
/// ```toml
/// event_queue_capacity = 1024
///
/// [[drive]]
/// name = "mem"
/// addr = "memory://"
///
/// [[drive]]
/// name = "shared"
/// addr = "remote+http://[::1]:8000/shared"
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MountConfig {
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    #[serde(default, rename = "drive")]
    pub drives: Vec<DriveConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DriveConfig {
    pub name: String,
    /// The backend address, see [crate::backend::from_addr].
    pub addr: String,
}

fn default_event_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            drives: Vec::new(),
        }
    }
}

impl MountConfig {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s)
            .map_err(|e| Error::ConfigurationError(format!("invalid mount config: {}", e)))
    }

    pub async fn load(path: &Path) -> Result<Self, Error> {
        let s = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::ConfigurationError(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&s)
    }
}

/// The entry point to all mounted drives.
///
/// Each drive is an independent store, wrapped in a [ListenableStore], and
/// addressed by its name in [AfsPath]s.
pub struct AppData {
    drives: BTreeMap<String, Arc<ListenableStore>>,
    registry: PseudoClassRegistry,
    event_queue_capacity: usize,
}

impl AppData {
    pub fn new(registry: PseudoClassRegistry) -> Self {
        Self {
            drives: BTreeMap::new(),
            registry,
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// Mounts all drives of the config. Fails on the first drive that can't be
    /// mounted, closing the ones mounted before.
    pub async fn from_config(
        config: &MountConfig,
        registry: PseudoClassRegistry,
    ) -> Result<Self, Error> {
        let mut app_data = Self::new(registry);
        app_data.event_queue_capacity = config.event_queue_capacity;

        for drive in &config.drives {
            if let Err(e) = app_data.mount_addr(&drive.name, &drive.addr).await {
                if let Err(close_err) = app_data.close().await {
                    warn!(err=%close_err, "failed to close drives");
                }
                return Err(e);
            }
        }

        Ok(app_data)
    }

    /// Mounts a backend under the given drive name. Mounting the same name
    /// twice fails with [Error::ConfigurationError].
    pub fn mount(
        &mut self,
        name: &str,
        backend: Box<dyn StoreBackend>,
    ) -> Result<Arc<ListenableStore>, Error> {
        check_drive_name(name)?;
        if self.drives.contains_key(name) {
            return Err(Error::ConfigurationError(format!(
                "drive {} is mounted already",
                name
            )));
        }

        let store = Arc::new(ListenableStore::with_capacity(
            backend,
            self.event_queue_capacity,
        ));
        self.drives.insert(name.to_string(), store.clone());
        info!(drive = name, "mounted drive");
        Ok(store)
    }

    /// Constructs the backend from its address, and mounts it.
    #[instrument(skip(self))]
    pub async fn mount_addr(&mut self, name: &str, addr: &str) -> Result<Arc<ListenableStore>, Error> {
        check_drive_name(name)?;
        if self.drives.contains_key(name) {
            return Err(Error::ConfigurationError(format!(
                "drive {} is mounted already",
                name
            )));
        }

        let backend = from_addr(addr).await.map_err(|e| {
            Error::ConfigurationError(format!("unable to mount drive {}: {}", name, e))
        })?;
        self.mount(name, backend)
    }

    pub fn registry(&self) -> &PseudoClassRegistry {
        &self.registry
    }

    pub fn drive(&self, name: &str) -> Option<&Arc<ListenableStore>> {
        self.drives.get(name)
    }

    pub fn drive_names(&self) -> impl Iterator<Item = &str> {
        self.drives.keys().map(String::as_str)
    }

    pub fn drives(&self) -> impl Iterator<Item = (&str, &Arc<ListenableStore>)> {
        self.drives.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the root of a drive, None if no such drive is mounted.
    pub async fn root(&self, drive: &str) -> Result<Option<NodeHandle>, Error> {
        let Some(store) = self.drives.get(drive) else {
            return Ok(None);
        };
        let root = store.get_root_node(drive).await?;
        Ok(Some(NodeHandle::new(drive.into(), store.clone(), root.info)))
    }

    /// Resolves a path like `drive:/a/b`. Returns None if the drive isn't
    /// mounted or a component doesn't exist.
    pub async fn get_node(&self, path: &str) -> Result<Option<NodeHandle>, Error> {
        self.resolve(&path.parse()?).await
    }

    #[instrument(skip(self), fields(path = %path))]
    pub async fn resolve(&self, path: &AfsPath) -> Result<Option<NodeHandle>, Error> {
        let Some(mut node) = self.root(path.drive()).await? else {
            return Ok(None);
        };

        for component in path.components() {
            match node.child(component).await? {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }

        Ok(Some(node))
    }

    /// Resolves a path, and wraps the node in the view registered for its
    /// pseudo class.
    pub async fn view(&self, path: &str) -> Result<Option<Box<dyn NodeView>>, Error> {
        Ok(self
            .get_node(path)
            .await?
            .map(|node| self.registry.resolve(node)))
    }

    /// Closes all drives. Keeps going if one of them fails, and returns the
    /// first error.
    pub async fn close(&self) -> Result<(), Error> {
        let mut res = Ok(());
        for (name, store) in &self.drives {
            if let Err(e) = store.close().await {
                warn!(drive=%name, err=%e, "failed to close drive");
                if res.is_ok() {
                    res = Err(e);
                }
            }
        }
        res
    }
}

fn check_drive_name(name: &str) -> Result<(), Error> {
    if validate_name(name).is_err() || name.contains(':') {
        return Err(Error::ConfigurationError(format!(
            "invalid drive name {:?}",
            name
        )));
    }
    Ok(())
}
