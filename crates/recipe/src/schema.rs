//! Recipe file shape.
//!
//! A recipe is a parameterized template producing child want declarations.
//! Child templates reuse the plain want-config shape; parameter references
//! appear either as `{param: name}` objects or as `{{name}}` placeholders
//! inside strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use wunsch_core::{StateMap, WantConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    /// Parameter defaults; instantiation overrides win.
    #[serde(default)]
    pub parameters: StateMap,
    #[serde(default)]
    pub wants: Vec<WantConfig>,
    #[serde(default)]
    pub state: Vec<StateDef>,
    /// Which child fields contribute to the parent's final result.
    #[serde(default)]
    pub result: Vec<ResultSpec>,
}

/// Wrapper matching the on-disk `recipe:` document root.
#[derive(Debug, Deserialize)]
pub struct RecipeFile {
    pub recipe: Recipe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSpec {
    pub want_name: String,
    #[serde(default)]
    pub state_field: Option<String>,
    #[serde(default)]
    pub stat_name: Option<String>,
}

impl ResultSpec {
    /// The field to read off the child's state.
    pub fn field(&self) -> Option<&str> {
        self.state_field
            .as_deref()
            .or(self.stat_name.as_deref())
    }
}

/// A recipe with all parameter references resolved.
#[derive(Debug, Clone)]
pub struct InstantiatedRecipe {
    pub wants: Vec<WantConfig>,
    pub result: Vec<ResultSpec>,
}
