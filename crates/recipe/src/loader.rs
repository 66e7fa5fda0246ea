//! Recipe loading and parameter substitution.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use wunsch_core::{StateMap, WantConfig};

use crate::error::RecipeError;
use crate::schema::{InstantiatedRecipe, Recipe, RecipeFile, ResultSpec};

pub fn load_recipe(path: &Path) -> Result<Recipe, RecipeError> {
    let text = std::fs::read_to_string(path)?;
    let file: RecipeFile = serde_yaml::from_str(&text)?;
    debug!(path = %path.display(), wants = file.recipe.wants.len(), "loaded recipe");
    Ok(file.recipe)
}

/// Resolve all parameter references in a recipe with the given overrides
/// merged over the recipe's defaults.
pub fn instantiate(recipe: &Recipe, overrides: &StateMap) -> Result<InstantiatedRecipe, RecipeError> {
    if recipe.wants.is_empty() {
        return Err(RecipeError::Empty);
    }

    let mut params = recipe.parameters.clone();
    for (k, v) in overrides {
        if !params.contains_key(k) {
            warn!(param = %k, "override for parameter the recipe does not declare");
        }
        params.insert(k.clone(), v.clone());
    }

    let mut wants = Vec::with_capacity(recipe.wants.len());
    for template in &recipe.wants {
        wants.push(instantiate_want(template, &params)?);
    }

    let mut result = Vec::with_capacity(recipe.result.len());
    for spec in &recipe.result {
        result.push(ResultSpec {
            want_name: substitute_string(&spec.want_name, &params)?.into_plain_string(),
            state_field: spec.state_field.clone(),
            stat_name: spec.stat_name.clone(),
        });
    }

    Ok(InstantiatedRecipe { wants, result })
}

fn instantiate_want(template: &WantConfig, params: &StateMap) -> Result<WantConfig, RecipeError> {
    let mut want = template.clone();
    want.metadata.name = substitute_string(&want.metadata.name, params)?.into_plain_string();

    let mut labels = wunsch_core::LabelMap::new();
    for (k, v) in &template.metadata.labels {
        labels.insert(
            k.clone(),
            substitute_string(v, params)?.into_plain_string(),
        );
    }
    want.metadata.labels = labels;

    let mut using = Vec::with_capacity(template.spec.using.len());
    for selector in &template.spec.using {
        let mut resolved = wunsch_core::LabelSelector::new();
        for (k, v) in selector {
            resolved.insert(
                k.clone(),
                substitute_string(v, params)?.into_plain_string(),
            );
        }
        using.push(resolved);
    }
    want.spec.using = using;

    let mut resolved_params = StateMap::new();
    for (k, v) in &template.spec.params {
        resolved_params.insert(k.clone(), substitute_value(v, params)?);
    }
    want.spec.params = resolved_params;

    Ok(want)
}

/// Outcome of substituting a string: either a raw parameter value (when the
/// whole string was one placeholder) or interpolated text.
enum Substituted {
    Raw(Value),
    Text(String),
}

impl Substituted {
    fn into_plain_string(self) -> String {
        match self {
            Substituted::Raw(v) => value_to_text(&v),
            Substituted::Text(s) => s,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Substituted::Raw(v) => v,
            Substituted::Text(s) => Value::String(s),
        }
    }
}

fn substitute_value(value: &Value, params: &StateMap) -> Result<Value, RecipeError> {
    match value {
        // `{param: name}` reference
        Value::Object(map) if map.len() == 1 && map.contains_key("param") => {
            let name = map["param"]
                .as_str()
                .ok_or_else(|| RecipeError::UnknownParameter(map["param"].to_string()))?;
            params
                .get(name)
                .cloned()
                .ok_or_else(|| RecipeError::UnknownParameter(name.to_string()))
        }
        Value::String(s) => Ok(substitute_string(s, params)?.into_value()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(item, params)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, params)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Replace `{{name}}` placeholders. A string that is exactly one placeholder
/// yields the raw parameter value so numeric params stay numeric.
fn substitute_string(input: &str, params: &StateMap) -> Result<Substituted, RecipeError> {
    let trimmed = input.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        let name = trimmed[2..trimmed.len() - 2].trim();
        if !name.contains("{{") && !name.contains("}}") {
            return params
                .get(name)
                .cloned()
                .map(Substituted::Raw)
                .ok_or_else(|| RecipeError::UnknownParameter(name.to_string()));
        }
    }

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let name = after[..end].trim();
        let value = params
            .get(name)
            .ok_or_else(|| RecipeError::UnknownParameter(name.to_string()))?;
        out.push_str(&value_to_text(value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(Substituted::Text(out))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
