pub mod loader;
pub mod schema;

pub use loader::{
    discover, load_from_path, load_from_str, load_or_default, ConfigError, CONFIG_ENV,
};
pub use schema::{
    AnnotationSettings, ExportSettings, ImportSettings, ResolverSettings, Settings,
    ValidationError, ValidationIssue,
};
