//! Typed views over raw nodes, selected by the node's pseudo class.
//!
//! The store treats pseudo classes as opaque strings. Calling code resolves a
//! [NodeHandle] through a [PseudoClassRegistry] once, and works with the
//! returned [NodeView] from then on. Unknown pseudo classes resolve to
//! [GenericNode].

use std::{any::Any, collections::BTreeMap, fmt, sync::Arc};

use crate::{backend::StoreBackend, handle::NodeHandle, node::AttributeValue, Error};

pub const FOLDER: &str = "folder";
pub const PROJECT: &str = "project";
pub const CASE: &str = "case";
pub const SCRIPT: &str = "script";
pub const ANALYSIS_RUNNER: &str = "analysis-runner";

/// A typed view over a node.
pub trait NodeView: fmt::Debug + Send + Sync {
    fn handle(&self) -> &NodeHandle;

    fn as_any(&self) -> &dyn Any;
}

impl dyn NodeView {
    /// Returns the concrete view, if it's of type `T`.
    pub fn downcast_ref<T: NodeView + 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

pub type ViewConstructor = Arc<dyn Fn(NodeHandle) -> Box<dyn NodeView> + Send + Sync>;

/// Maps pseudo classes to the constructor of their view.
#[derive(Clone, Default)]
pub struct PseudoClassRegistry(BTreeMap<String, ViewConstructor>);

impl PseudoClassRegistry {
    /// Registers a constructor. Registering the same pseudo class twice is a
    /// configuration error.
    pub fn register<F>(&mut self, pseudo_class: &str, constructor: F) -> Result<(), Error>
    where
        F: Fn(NodeHandle) -> Box<dyn NodeView> + Send + Sync + 'static,
    {
        if self.0.contains_key(pseudo_class) {
            return Err(Error::ConfigurationError(format!(
                "pseudo class {} registered twice",
                pseudo_class
            )));
        }
        self.0
            .insert(pseudo_class.to_string(), Arc::new(constructor));
        Ok(())
    }

    pub fn contains(&self, pseudo_class: &str) -> bool {
        self.0.contains_key(pseudo_class)
    }

    pub fn resolve(&self, handle: NodeHandle) -> Box<dyn NodeView> {
        match self.0.get(handle.pseudo_class()) {
            Some(constructor) => constructor(handle),
            None => Box::new(GenericNode(handle)),
        }
    }
}

fn view<V: NodeView + 'static>(wrap: fn(NodeHandle) -> V) -> ViewConstructor {
    Arc::new(move |h| -> Box<dyn NodeView> { Box::new(wrap(h)) })
}

fn default_views() -> [(&'static str, ViewConstructor); 5] {
    [
        (FOLDER, view(Folder)),
        (PROJECT, view(Project)),
        (CASE, view(ImportedCase)),
        (SCRIPT, view(Script)),
        (ANALYSIS_RUNNER, view(AnalysisRunner)),
    ]
}

/// Registers the views of all built-in pseudo classes. Fails without
/// registering anything if one of them is registered already.
pub fn add_default_views(reg: &mut PseudoClassRegistry) -> Result<(), Error> {
    let views = default_views();
    if let Some((pseudo_class, _)) = views.iter().find(|(pc, _)| reg.contains(pc)) {
        return Err(Error::ConfigurationError(format!(
            "pseudo class {} registered twice",
            pseudo_class
        )));
    }
    for (pseudo_class, constructor) in views {
        reg.0.insert(pseudo_class.to_string(), constructor);
    }
    Ok(())
}

/// A registry knowing all built-in pseudo classes.
pub fn default_registry() -> PseudoClassRegistry {
    PseudoClassRegistry(
        default_views()
            .into_iter()
            .map(|(pseudo_class, constructor)| (pseudo_class.to_string(), constructor))
            .collect(),
    )
}

macro_rules! impl_node_view {
    ($($view:ident),*) => {
        $(
            impl NodeView for $view {
                fn handle(&self) -> &NodeHandle {
                    &self.0
                }

                fn as_any(&self) -> &dyn Any {
                    self
                }
            }
        )*
    };
}

impl_node_view!(
    GenericNode,
    Folder,
    Project,
    ImportedCase,
    Script,
    AnalysisRunner
);

/// A node of a pseudo class without a registered view.
#[derive(Debug)]
pub struct GenericNode(pub NodeHandle);

#[derive(Debug)]
pub struct Folder(pub NodeHandle);

impl Folder {
    pub async fn children(&self) -> Result<Vec<NodeHandle>, Error> {
        self.0.children().await
    }

    pub async fn create_folder(&self, name: &str) -> Result<Folder, Error> {
        Ok(Folder(self.0.create_child(name, FOLDER, "").await?))
    }

    pub async fn create_project(&self, name: &str, description: &str) -> Result<Project, Error> {
        Ok(Project(self.0.create_child(name, PROJECT, description).await?))
    }
}

/// Groups the cases, scripts and analyses of one study.
#[derive(Debug)]
pub struct Project(pub NodeHandle);

impl Project {
    pub async fn files(&self) -> Result<Vec<NodeHandle>, Error> {
        self.0.children().await
    }

    /// Stores a case file in a new [ImportedCase] node.
    pub async fn import_case(
        &self,
        name: &str,
        format: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<ImportedCase, Error> {
        let node = self.0.create_child(name, CASE, "").await?;
        node.set_attribute(ImportedCase::FORMAT, format.into())
            .await?;
        node.set_attribute(ImportedCase::FILE_NAME, file_name.into())
            .await?;
        node.write_data_source(ImportedCase::DATA_SOURCE, file_name, data)
            .await?;
        Ok(ImportedCase(node))
    }

    pub async fn create_script(&self, name: &str, content: &str) -> Result<Script, Error> {
        let script = Script(self.0.create_child(name, SCRIPT, "").await?);
        script.write(content).await?;
        Ok(script)
    }

    /// Creates an [AnalysisRunner] working on the given case.
    pub async fn create_analysis_runner(
        &self,
        name: &str,
        case: &ImportedCase,
    ) -> Result<AnalysisRunner, Error> {
        let runner = AnalysisRunner(self.0.create_child(name, ANALYSIS_RUNNER, "").await?);
        runner.set_case(case).await?;
        Ok(runner)
    }
}

/// A case file imported into a project, kept as a data source.
#[derive(Debug)]
pub struct ImportedCase(pub NodeHandle);

impl ImportedCase {
    pub const FORMAT: &'static str = "format";
    pub const FILE_NAME: &'static str = "fileName";
    pub const DATA_SOURCE: &'static str = "case";

    pub async fn format(&self) -> Result<Option<String>, Error> {
        self.0.get_string(Self::FORMAT).await
    }

    pub async fn file_name(&self) -> Result<Option<String>, Error> {
        self.0.get_string(Self::FILE_NAME).await
    }

    /// Reads the case file. Fails with [Error::NotFound] if nothing was
    /// imported.
    pub async fn read(&self) -> Result<Vec<u8>, Error> {
        let file_name = self
            .file_name()
            .await?
            .ok_or_else(|| Error::NotFound(format!("case file of {}", self.0.id())))?;
        self.0
            .read_data_source(Self::DATA_SOURCE, &file_name)
            .await
    }
}

/// A script, with its text kept as a data source.
#[derive(Debug)]
pub struct Script(pub NodeHandle);

impl Script {
    pub const DATA_SOURCE: &'static str = "script";
    const FILE_NAME: &'static str = "script";

    pub async fn read(&self) -> Result<String, Error> {
        let data = self
            .0
            .read_data_source(Self::DATA_SOURCE, Self::FILE_NAME)
            .await?;
        String::from_utf8(data)
            .map_err(|e| Error::StorageError(format!("script isn't valid UTF-8: {}", e)))
    }

    pub async fn write(&self, content: &str) -> Result<(), Error> {
        self.0
            .write_data_source(Self::DATA_SOURCE, Self::FILE_NAME, content.as_bytes())
            .await
    }
}

/// Runs an analysis on a case, referenced by a dependency.
#[derive(Debug)]
pub struct AnalysisRunner(pub NodeHandle);

impl AnalysisRunner {
    pub const CASE_DEPENDENCY: &'static str = "case";

    /// Points the runner at another case, replacing the previous one.
    pub async fn set_case(&self, case: &ImportedCase) -> Result<(), Error> {
        let store = self.0.store();
        let id = self.0.id();
        for previous in store.get_dependencies(&id, Self::CASE_DEPENDENCY).await? {
            store
                .remove_dependency(&id, Self::CASE_DEPENDENCY, &previous)
                .await?;
        }
        store
            .add_dependency(&id, Self::CASE_DEPENDENCY, &case.0.id())
            .await?;
        self.0
            .set_attribute("caseName", AttributeValue::from(case.0.name()))
            .await
    }

    /// Returns the case the runner works on. None if there is none, or if it
    /// was deleted in the meantime.
    pub async fn case(&self) -> Result<Option<ImportedCase>, Error> {
        let store = self.0.store();
        let Some(target) = store
            .get_dependencies(&self.0.id(), Self::CASE_DEPENDENCY)
            .await?
            .into_iter()
            .next()
        else {
            return Ok(None);
        };

        match self.0.resolve(&target).await {
            Ok(node) => Ok(Some(ImportedCase(node))),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
