//! Pipeline definitions

use std::collections::BTreeMap;
use std::fmt;

use conveyor_core::error::ConfigError;

use crate::task::RESERVED_TASK_NAMES;

/// One entry in a task's dependency list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencySpec {
    /// `build`: the task in the same package
    SamePackage(String),
    /// `^build`: the task in every package the current one directly depends on
    Topological(String),
}

impl DependencySpec {
    /// Parse a raw spec string
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.strip_prefix('^') {
            Some(task) if !task.trim().is_empty() => Some(Self::Topological(task.to_string())),
            Some(_) => None,
            None if !raw.trim().is_empty() => Some(Self::SamePackage(raw.to_string())),
            None => None,
        }
    }

    /// The task this spec points at
    pub fn task(&self) -> &str {
        match self {
            Self::SamePackage(task) | Self::Topological(task) => task,
        }
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SamePackage(task) => write!(f, "{}", task),
            Self::Topological(task) => write!(f, "^{}", task),
        }
    }
}

/// Parsed pipeline: task name to its ordered dependency specs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSpec {
    tasks: BTreeMap<String, Vec<DependencySpec>>,
}

impl PipelineSpec {
    /// Parse the raw `pipeline` map from configuration.
    ///
    /// Fails on empty or bare-caret specs, on task names reserved for cache
    /// nodes, and on dependencies naming tasks the pipeline does not declare.
    pub fn parse(raw: &BTreeMap<String, Vec<String>>) -> Result<Self, ConfigError> {
        let mut tasks = BTreeMap::new();

        for (task, deps) in raw {
            if RESERVED_TASK_NAMES.contains(&task.as_str()) {
                return Err(ConfigError::InvalidPipeline {
                    task: task.clone(),
                    message: "task name is reserved for cache nodes".to_string(),
                });
            }

            let mut specs = Vec::with_capacity(deps.len());
            for dep in deps {
                let spec = DependencySpec::parse(dep).ok_or_else(|| ConfigError::InvalidPipeline {
                    task: task.clone(),
                    message: format!("malformed dependency '{}'", dep),
                })?;
                if !raw.contains_key(spec.task()) {
                    return Err(ConfigError::InvalidPipeline {
                        task: task.clone(),
                        message: format!("depends on undeclared task '{}'", spec.task()),
                    });
                }
                if !specs.contains(&spec) {
                    specs.push(spec);
                }
            }
            tasks.insert(task.clone(), specs);
        }

        Ok(Self { tasks })
    }

    /// Declared task names, ordered
    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    /// Dependency specs of a task
    pub fn dependencies(&self, task: &str) -> Option<&[DependencySpec]> {
        self.tasks.get(task).map(Vec::as_slice)
    }

    /// Whether the pipeline declares a task
    pub fn contains(&self, task: &str) -> bool {
        self.tasks.contains_key(task)
    }

    /// Number of declared tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no tasks are declared
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(task, deps)| {
                (
                    task.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_parse_specs() {
        assert_eq!(
            DependencySpec::parse("^build"),
            Some(DependencySpec::Topological("build".to_string()))
        );
        assert_eq!(
            DependencySpec::parse("build"),
            Some(DependencySpec::SamePackage("build".to_string()))
        );
        assert_eq!(DependencySpec::parse("^"), None);
        assert_eq!(DependencySpec::parse(""), None);
    }

    #[test]
    fn test_parse_pipeline() {
        let pipeline =
            PipelineSpec::parse(&raw(&[("build", &["^build"]), ("test", &["build"])])).unwrap();
        assert_eq!(pipeline.len(), 2);
        assert_eq!(
            pipeline.dependencies("test").unwrap(),
            &[DependencySpec::SamePackage("build".to_string())]
        );
        assert_eq!(pipeline.dependencies("build").unwrap()[0].to_string(), "^build");
    }

    #[test]
    fn test_reserved_name_rejected() {
        let err = PipelineSpec::parse(&raw(&[("cachePut", &[])])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPipeline { .. }));
    }

    #[test]
    fn test_undeclared_dependency_rejected() {
        assert!(PipelineSpec::parse(&raw(&[("test", &["build"])])).is_err());
    }

    #[test]
    fn test_duplicate_specs_collapsed() {
        let pipeline =
            PipelineSpec::parse(&raw(&[("build", &["^build", "^build"])])).unwrap();
        assert_eq!(pipeline.dependencies("build").unwrap().len(), 1);
    }
}
