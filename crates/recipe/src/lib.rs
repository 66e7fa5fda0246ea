pub mod error;
pub mod loader;
pub mod schema;

pub use error::RecipeError;
pub use loader::{instantiate, load_recipe};
pub use schema::{InstantiatedRecipe, Recipe, ResultSpec, StateDef};
