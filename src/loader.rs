use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{Violations, WorkloadConfig};

/// Why an environment failed to load. Every variant names the file at fault;
/// there is no partial success, the first bad declaration aborts the load.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("configuration directory not found: {}", .path.display())]
    MissingDirectory { path: PathBuf },

    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{}: not valid YAML: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("{}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        source: serde_path_to_error::Error<serde_yaml::Error>,
    },

    #[error("{}: invalid declaration: {source}", .path.display())]
    Invalid { path: PathBuf, source: Violations },

    #[error(
        "{}: declared name {declared:?} does not match the file name {stem:?}",
        .path.display()
    )]
    NameMismatch {
        path: PathBuf,
        declared: String,
        stem: String,
    },

    #[error(
        "service {name:?} is declared twice: {} and {}",
        .first.display(),
        .second.display()
    )]
    DuplicateService {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// Loads every service declaration for one environment.
///
/// Scans `<config_root>/<environment>` for `*.yml` / `*.yaml` files (sorted
/// by filename, no recursion) and returns validated configurations keyed by
/// file stem. The declared `name` must match the stem, so there is exactly
/// one source of truth for what a service is called.
pub fn load_service_configs(
    config_root: &Path,
    environment: &str,
) -> Result<BTreeMap<String, WorkloadConfig>, LoadError> {
    let dir = config_root.join(environment);
    if !dir.is_dir() {
        return Err(LoadError::MissingDirectory { path: dir });
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|source| LoadError::Io {
        path: dir.clone(),
        source,
    })? {
        let entry = entry.map_err(|source| LoadError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yml") | Some("yaml")
        ) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut services = BTreeMap::new();
    let mut declared_in: BTreeMap<String, PathBuf> = BTreeMap::new();
    for path in paths {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let config = load_declaration(&path)?;
        if config.name != stem {
            return Err(LoadError::NameMismatch {
                path,
                declared: config.name,
                stem,
            });
        }
        if let Some(first) = declared_in.get(&stem) {
            return Err(LoadError::DuplicateService {
                name: stem,
                first: first.clone(),
                second: path,
            });
        }
        declared_in.insert(stem.clone(), path);
        services.insert(stem, config);
    }

    Ok(services)
}

fn load_declaration(path: &Path) -> Result<WorkloadConfig, LoadError> {
    let contents = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    // Two passes so a syntax error and a shape error report differently: the
    // first is a YAML problem, the second names the offending field path.
    let tree: serde_yaml::Value =
        serde_yaml::from_str(&contents).map_err(|source| LoadError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
    let config: WorkloadConfig =
        serde_path_to_error::deserialize(tree).map_err(|source| LoadError::Decode {
            path: path.to_path_buf(),
            source,
        })?;

    config.validate().map_err(|source| LoadError::Invalid {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{load_service_configs, LoadError};

    fn write(root: &Path, environment: &str, file: &str, contents: &str) {
        let dir = root.join(environment);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), contents).unwrap();
    }

    fn declaration(name: &str) -> String {
        format!(
            "name: {name}\n\
             namespace: sandbox\n\
             container:\n\
             \x20 image: org/{name}:1.0\n\
             \x20 port: 8080\n"
        )
    }

    #[test]
    fn loads_one_entry_per_file_keyed_by_stem() {
        let root = tempdir().unwrap();
        write(root.path(), "sandbox", "api.yml", &declaration("api"));
        write(root.path(), "sandbox", "worker.yaml", &declaration("worker"));
        write(root.path(), "sandbox", "notes.md", "not a declaration");

        let services = load_service_configs(root.path(), "sandbox").unwrap();
        let names: Vec<&String> = services.keys().collect();
        assert_eq!(names, ["api", "worker"]);
        assert_eq!(services["api"].container.image, "org/api:1.0");
    }

    #[test]
    fn defaults_are_applied_to_sparse_declarations() {
        let root = tempdir().unwrap();
        write(
            root.path(),
            "sandbox",
            "api.yml",
            "name: api\n\
             namespace: sandbox\n\
             container: {image: \"org/api:1.0\", port: 8080}\n",
        );

        let services = load_service_configs(root.path(), "sandbox").unwrap();
        let api = &services["api"];
        assert_eq!(api.replicas, 1);
        assert_eq!(api.service.port, 80);
        assert_eq!(api.service.type_.as_str(), "ClusterIP");
        assert!(!api.ingress.enabled);
    }

    #[test]
    fn missing_directory_is_fatal() {
        let root = tempdir().unwrap();
        let err = load_service_configs(root.path(), "production").unwrap_err();
        match err {
            LoadError::MissingDirectory { path } => {
                assert!(path.ends_with("production"));
            }
            other => panic!("expected MissingDirectory, got {other:?}"),
        }
    }

    #[test]
    fn unparseable_yaml_is_malformed() {
        let root = tempdir().unwrap();
        write(root.path(), "sandbox", "api.yml", "{unbalanced");

        let err = load_service_configs(root.path(), "sandbox").unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn missing_required_field_names_the_field() {
        let root = tempdir().unwrap();
        write(root.path(), "sandbox", "bad.yml", "namespace: sandbox\n");

        let err = load_service_configs(root.path(), "sandbox").unwrap_err();
        match err {
            LoadError::Decode { path, source } => {
                assert!(path.ends_with("bad.yml"));
                let message = source.to_string();
                assert!(
                    message.contains("name") || message.contains("container"),
                    "{message}"
                );
            }
            other => panic!("expected Decode, got {other:?}"),
        }
    }

    #[test]
    fn wrong_type_names_the_field_path() {
        let root = tempdir().unwrap();
        write(
            root.path(),
            "sandbox",
            "api.yml",
            "name: api\n\
             namespace: sandbox\n\
             container: {image: \"org/api:1.0\", port: http}\n",
        );

        let err = load_service_configs(root.path(), "sandbox").unwrap_err();
        match err {
            LoadError::Decode { source, .. } => {
                assert!(source.to_string().contains("container.port"), "{source}");
            }
            other => panic!("expected Decode, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_port_is_a_constraint_violation() {
        let root = tempdir().unwrap();
        write(
            root.path(),
            "sandbox",
            "api.yml",
            "name: api\n\
             namespace: sandbox\n\
             container: {image: \"org/api:1.0\", port: 70000}\n",
        );

        let err = load_service_configs(root.path(), "sandbox").unwrap_err();
        match err {
            LoadError::Invalid { source, .. } => {
                assert!(source.0.iter().any(|v| v.field == "container.port"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn declared_name_must_match_file_stem() {
        let root = tempdir().unwrap();
        write(root.path(), "sandbox", "api.yml", &declaration("graphql"));

        let err = load_service_configs(root.path(), "sandbox").unwrap_err();
        match err {
            LoadError::NameMismatch { declared, stem, .. } => {
                assert_eq!(declared, "graphql");
                assert_eq!(stem, "api");
            }
            other => panic!("expected NameMismatch, got {other:?}"),
        }
    }

    #[test]
    fn same_stem_under_both_extensions_is_rejected() {
        let root = tempdir().unwrap();
        write(root.path(), "sandbox", "api.yml", &declaration("api"));
        write(root.path(), "sandbox", "api.yaml", &declaration("api"));

        let err = load_service_configs(root.path(), "sandbox").unwrap_err();
        match err {
            LoadError::DuplicateService { name, first, second } => {
                assert_eq!(name, "api");
                assert!(first.ends_with("api.yaml"));
                assert!(second.ends_with("api.yml"));
            }
            other => panic!("expected DuplicateService, got {other:?}"),
        }
    }

    #[test]
    fn loading_twice_yields_equal_mappings() {
        let root = tempdir().unwrap();
        write(root.path(), "sandbox", "api.yml", &declaration("api"));
        write(root.path(), "sandbox", "worker.yml", &declaration("worker"));

        let first = load_service_configs(root.path(), "sandbox").unwrap();
        let second = load_service_configs(root.path(), "sandbox").unwrap();
        assert_eq!(first, second);
    }
}
