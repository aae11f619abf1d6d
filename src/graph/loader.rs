//! Declaration loading.
//!
//! Reads declaration documents, substitutes workspace variables, loads file
//! payloads, checks identities and references, and produces a
//! [`ResourceGraph`].

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::expr::{self, SubstitutionError};
use super::resource::{Resource, ResourceId, SourceLocation};
use super::{Output, RenderTarget, ResourceGraph};
use crate::config::{DeclarationDocument, OutputDecl, RenderDecl, ResourceDecl};
use crate::error::{ConfigError, HalyardError, Result};

/// A parsed declaration document and where it came from.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    /// Path of the document on disk.
    pub path: PathBuf,
    /// Short label used in error messages.
    pub label: String,
    /// Parsed content.
    pub document: DeclarationDocument,
}

impl SourceDocument {
    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Loads declaration documents into a resource graph.
#[derive(Debug, Clone, Default)]
pub struct DeclarationLoader {
    variables: BTreeMap<String, String>,
}

impl DeclarationLoader {
    /// Creates a loader with the given workspace variables.
    #[must_use]
    pub const fn new(variables: BTreeMap<String, String>) -> Self {
        Self { variables }
    }

    /// Loads every source relative to `base` and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for missing files, malformed YAML,
    /// duplicate identities or unresolved references.
    pub fn load(&self, base: &Path, sources: &[String]) -> Result<ResourceGraph> {
        let files = collect_sources(base, sources)?;
        info!("Loading {} declaration file(s)", files.len());

        let documents = files
            .iter()
            .map(|path| read_document(path, base))
            .collect::<Result<Vec<_>>>()?;

        self.build(documents)
    }

    /// Builds the graph from already parsed documents.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for duplicate identities, unresolved
    /// references, undefined variables or unreadable file payloads.
    pub fn build(&self, documents: Vec<SourceDocument>) -> Result<ResourceGraph> {
        let mut resources: Vec<Resource> = Vec::new();
        let mut seen: HashMap<ResourceId, SourceLocation> = HashMap::new();
        let mut outputs: Vec<Output> = Vec::new();
        let mut renders: Vec<RenderTarget> = Vec::new();

        for source in &documents {
            for (index, decl) in source.document.resources.iter().enumerate() {
                let location = SourceLocation {
                    file: source.label.clone(),
                    index,
                    section: "resources",
                };
                let id = ResourceId::new(&decl.kind, &decl.name);

                if let Some(first) = seen.get(&id) {
                    return Err(HalyardError::Config(ConfigError::DuplicateName {
                        kind: decl.kind.clone(),
                        name: decl.name.clone(),
                        first: first.to_string(),
                        second: location.to_string(),
                    }));
                }
                seen.insert(id, location.clone());

                resources.push(self.load_resource(source, decl, location)?);
            }
        }

        for resource in &resources {
            for dependency in resource.dependencies() {
                if !seen.contains_key(&dependency) {
                    let reference = resource
                        .references
                        .iter()
                        .find(|(_, r)| r.target == dependency)
                        .map_or_else(|| dependency.to_string(), |(_, r)| r.to_string());
                    return Err(unresolved(&resource.id.to_string(), reference, &resource.location));
                }
            }
        }

        let mut output_names: HashMap<String, SourceLocation> = HashMap::new();
        let mut render_names: HashMap<String, SourceLocation> = HashMap::new();
        for source in &documents {
            for (index, decl) in source.document.outputs.iter().enumerate() {
                let location = SourceLocation {
                    file: source.label.clone(),
                    index,
                    section: "outputs",
                };
                check_unique("output", &decl.name, &location, &mut output_names)?;
                outputs.push(self.load_output(decl, location, &seen)?);
            }

            for (index, decl) in source.document.renders.iter().enumerate() {
                let location = SourceLocation {
                    file: source.label.clone(),
                    index,
                    section: "renders",
                };
                check_unique("render", &decl.name, &location, &mut render_names)?;
                renders.push(load_render(source.dir(), decl, location));
            }
        }

        debug!(
            "Loaded {} resource(s), {} output(s), {} render(s)",
            resources.len(),
            outputs.len(),
            renders.len()
        );

        Ok(ResourceGraph::new(resources, outputs, renders))
    }

    fn load_resource(
        &self,
        source: &SourceDocument,
        decl: &ResourceDecl,
        location: SourceLocation,
    ) -> Result<Resource> {
        let owner = format!("{}.{}", decl.kind, decl.name);
        let mut attributes = BTreeMap::new();

        for (key, value) in &decl.attributes {
            let substituted = expr::substitute_variables(value, &self.variables)
                .map_err(|e| substitution_error(&owner, e, &location))?;
            attributes.insert(key.clone(), substituted);
        }

        for (key, relative) in &decl.files {
            let path = source.dir().join(relative);
            let content = std::fs::read_to_string(&path).map_err(|e| {
                HalyardError::Config(ConfigError::parse(
                    format!("Failed to read payload '{}' for {owner}: {e}", path.display()),
                    Some(location.to_string()),
                ))
            })?;
            debug!("Loaded {} byte payload into {}.{}", content.len(), owner, key);
            // Payloads are opaque: escape anything that looks like an expression.
            attributes.insert(key.clone(), Value::String(content.replace("${", "$${")));
        }

        let mut references = Vec::new();
        for (key, value) in &attributes {
            let mut found = Vec::new();
            expr::collect_references(value, &mut found).map_err(|message| {
                HalyardError::Config(ConfigError::parse(
                    format!("{owner}.{key}: {message}"),
                    Some(location.to_string()),
                ))
            })?;
            references.extend(found.into_iter().map(|r| (key.clone(), r)));
        }

        let depends_on = decl
            .depends_on
            .iter()
            .map(|address| {
                ResourceId::parse(address).map_err(|message| {
                    HalyardError::Config(ConfigError::parse(
                        format!("{owner}.depends_on: {message}"),
                        Some(location.to_string()),
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Resource {
            id: ResourceId::new(&decl.kind, &decl.name),
            attributes,
            depends_on,
            references,
            replace_on_change: decl.lifecycle.replace_on_change.clone(),
            location,
        })
    }

    fn load_output(
        &self,
        decl: &OutputDecl,
        location: SourceLocation,
        declared: &HashMap<ResourceId, SourceLocation>,
    ) -> Result<Output> {
        let owner = format!("output.{}", decl.name);
        let substituted = expr::substitute_variables(&Value::String(decl.value.clone()), &self.variables)
            .map_err(|e| substitution_error(&owner, e, &location))?;
        let value = expr::value_to_text(&substituted);

        let mut references = Vec::new();
        expr::collect_references(&substituted, &mut references).map_err(|message| {
            HalyardError::Config(ConfigError::parse(
                format!("{owner}: {message}"),
                Some(location.to_string()),
            ))
        })?;

        if let Some(missing) = references.iter().find(|r| !declared.contains_key(&r.target)) {
            return Err(unresolved(&owner, missing.to_string(), &location));
        }

        Ok(Output {
            name: decl.name.clone(),
            value,
            references,
            description: decl.description.clone(),
            sensitive: decl.sensitive,
            location,
        })
    }
}

/// Expands the configured sources into declaration files.
///
/// Directories contribute their `*.yaml` and `*.yml` files in name order.
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` for a source that does not exist.
pub fn collect_sources(base: &Path, sources: &[String]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for source in sources {
        let path = base.join(source);
        if path.is_dir() {
            let entries = std::fs::read_dir(&path).map_err(|e| {
                HalyardError::Config(ConfigError::parse(
                    format!("Failed to read directory: {e}"),
                    Some(path.display().to_string()),
                ))
            })?;

            let mut found: Vec<PathBuf> = entries
                .filter_map(std::result::Result::ok)
                .map(|entry| entry.path())
                .filter(|p| p.is_file() && is_yaml(p))
                .collect();
            found.sort();
            debug!("Found {} declaration file(s) in {}", found.len(), path.display());
            files.extend(found);
        } else if path.is_file() {
            files.push(path);
        } else {
            return Err(HalyardError::Config(ConfigError::FileNotFound { path }));
        }
    }

    Ok(files)
}

/// Reads and parses one declaration document.
///
/// # Errors
///
/// Returns a parse error carrying the file, line and column.
pub fn read_document(path: &Path, base: &Path) -> Result<SourceDocument> {
    let label = path
        .strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string();

    let content = std::fs::read_to_string(path).map_err(|e| {
        HalyardError::Config(ConfigError::parse(
            format!("Failed to read file: {e}"),
            Some(label.clone()),
        ))
    })?;

    let document = parse_document(&content, &label)?;
    Ok(SourceDocument {
        path: path.to_path_buf(),
        label,
        document,
    })
}

/// Parses a declaration document from YAML.
///
/// # Errors
///
/// Returns a parse error with the line and column when serde reports them.
pub fn parse_document(content: &str, label: &str) -> Result<DeclarationDocument> {
    if content.trim().is_empty() {
        return Ok(DeclarationDocument::default());
    }

    serde_yaml::from_str(content).map_err(|e| {
        let location = e.location().map_or_else(
            || label.to_string(),
            |l| format!("{label}:{}:{}", l.line(), l.column()),
        );
        HalyardError::Config(ConfigError::parse(format!("YAML parse error: {e}"), Some(location)))
    })
}

fn load_render(dir: &Path, decl: &RenderDecl, location: SourceLocation) -> RenderTarget {
    let target = if decl.path.starts_with("~/") || Path::new(&decl.path).is_absolute() {
        PathBuf::from(&decl.path)
    } else {
        dir.join(&decl.path)
    };

    RenderTarget {
        name: decl.name.clone(),
        template: dir.join(&decl.template),
        variants: decl
            .variants
            .iter()
            .map(|(os, template)| (os.clone(), dir.join(template)))
            .collect(),
        path: target,
        location,
    }
}

fn check_unique(
    kind: &str,
    name: &str,
    location: &SourceLocation,
    seen: &mut HashMap<String, SourceLocation>,
) -> Result<()> {
    if let Some(first) = seen.get(name) {
        return Err(HalyardError::Config(ConfigError::DuplicateName {
            kind: kind.to_string(),
            name: name.to_string(),
            first: first.to_string(),
            second: location.to_string(),
        }));
    }
    seen.insert(name.to_string(), location.clone());
    Ok(())
}

fn unresolved(owner: &str, reference: String, location: &SourceLocation) -> HalyardError {
    HalyardError::Config(ConfigError::UnresolvedReference {
        resource: owner.to_string(),
        reference,
        location: location.to_string(),
    })
}

fn substitution_error(owner: &str, error: SubstitutionError, location: &SourceLocation) -> HalyardError {
    match error {
        SubstitutionError::UndefinedVariable(name) => {
            unresolved(owner, format!("${{var.{name}}}"), location)
        }
        SubstitutionError::Malformed(message) => HalyardError::Config(ConfigError::parse(
            format!("{owner}: {message}"),
            Some(location.to_string()),
        )),
    }
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml")
}
