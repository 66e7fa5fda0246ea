//! Config and type-definition loading.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};
use walkdir::WalkDir;

use wunsch_core::{Config, WantConfig, WantTypeDef};

use crate::error::RuntimeError;

/// Load a config file: either a `wants` list or a top-level recipe
/// reference, which is expanded through the recipe loader with its
/// parameter defaults.
pub fn load_config(path: &Path) -> Result<Vec<WantConfig>, RuntimeError> {
    let text = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&text)?;
    config.validate()?;

    if let Some(recipe_ref) = &config.recipe {
        let recipe_path = resolve_sibling(path, &recipe_ref.path);
        let recipe = wunsch_recipe::load_recipe(&recipe_path)?;
        let instantiated = wunsch_recipe::instantiate(&recipe, &recipe_ref.params)?;
        debug!(
            path = %path.display(),
            recipe = %recipe_path.display(),
            wants = instantiated.wants.len(),
            "config expanded from recipe"
        );
        return Ok(instantiated.wants);
    }

    debug!(path = %path.display(), wants = config.wants.len(), "config loaded");
    Ok(config.wants)
}

/// Relative recipe paths resolve against the config file's directory.
fn resolve_sibling(config_path: &Path, reference: &str) -> std::path::PathBuf {
    let referenced = Path::new(reference);
    if referenced.is_absolute() {
        referenced.to_path_buf()
    } else {
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(referenced)
    }
}

/// Load every `*.yaml` type definition under a directory, keyed by type
/// name. Bad files are skipped with a warning.
pub fn load_type_defs(dir: &Path) -> HashMap<String, WantTypeDef> {
    let mut out = HashMap::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path
            .extension()
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false)
        {
            continue;
        }
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        match serde_yaml::from_str::<WantTypeDef>(&text) {
            Ok(def) if !def.type_name.is_empty() => {
                debug!(type_name = %def.type_name, file = %path.display(), "loaded type definition");
                out.insert(def.type_name.clone(), def);
            }
            Ok(_) => warn!(file = %path.display(), "type definition without a type name"),
            Err(err) => warn!(file = %path.display(), error = %err, "unparseable type definition"),
        }
    }
    out
}

/// Apply a type definition's defaults onto a config: state defaults under
/// explicit state, default requires appended, final-result field when unset.
pub fn apply_type_def(config: &mut WantConfig, def: &WantTypeDef) {
    let mut state = def.state.clone();
    for (k, v) in std::mem::take(&mut config.state) {
        state.insert(k, v);
    }
    config.state = state;

    for requirement in &def.requires {
        if !config.spec.requires.contains(requirement) {
            config.spec.requires.push(requirement.clone());
        }
    }

    if config.spec.final_result_field.is_none() {
        config.spec.final_result_field = def.final_result_field.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_wants_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
wants:
  - metadata:
      name: numbers
      type: sequence
      labels: { role: gen }
    spec:
      params: { count: 10 }
"#,
        )
        .unwrap();

        let wants = load_config(&path).unwrap();
        assert_eq!(wants.len(), 1);
        assert_eq!(wants[0].spec.params["count"], json!(10));
    }

    #[test]
    fn load_recipe_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("travel.yaml"),
            r#"
recipe:
  parameters:
    prefix: trip
  wants:
    - metadata:
        name: "{{prefix}}-hotel"
        type: hotel
"#,
        )
        .unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
recipe:
  path: travel.yaml
  params:
    prefix: summer
"#,
        )
        .unwrap();

        let wants = load_config(&path).unwrap();
        assert_eq!(wants.len(), 1);
        assert_eq!(wants[0].metadata.name, "summer-hotel");
    }

    #[test]
    fn config_with_both_sections_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            r#"
wants:
  - metadata: { name: a, type: t }
recipe:
  path: r.yaml
"#,
        )
        .unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn type_defaults_applied_under_explicit_state() {
        let mut config = WantConfig::new(
            wunsch_core::Metadata::new("q", "queue"),
            wunsch_core::WantSpec::default(),
        );
        config.state.insert("service_time".into(), json!(9.0));

        let def: WantTypeDef = serde_yaml::from_str(
            r#"
type: queue
state:
  service_time: 2.5
  served: 0
requires: [serve]
finalResultField: served
"#,
        )
        .unwrap();

        apply_type_def(&mut config, &def);
        // explicit value wins, missing default fills in
        assert_eq!(config.state["service_time"], json!(9.0));
        assert_eq!(config.state["served"], json!(0));
        assert_eq!(config.spec.requires, vec!["serve"]);
        assert_eq!(config.spec.final_result_field.as_deref(), Some("served"));
    }

    #[test]
    fn load_type_defs_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("queue.yaml"),
            "type: queue\nstate: { served: 0 }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "{{{").unwrap();

        let defs = load_type_defs(dir.path());
        assert_eq!(defs.len(), 1);
        assert!(defs.contains_key("queue"));
    }
}
