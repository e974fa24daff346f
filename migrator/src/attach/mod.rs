// Attach pipeline: index → resolve → attach, for catalogs and discovered tenants.

pub mod catalogs;
pub mod discovery;
pub mod engine;
pub mod indexer;
pub mod resolver;
pub mod tenants;

pub use catalogs::{attach_catalogs, catalogs_from_settings, default_catalogs};
pub use discovery::discover_aliases;
pub use engine::AttachEngine;
pub use indexer::{DataFile, FileIndex, FileRole, IndexSource};
pub use resolver::{normalize, resolve, resolve_log};
pub use tenants::{attach_orphans, attach_tenants, orphan_pass_needed};
