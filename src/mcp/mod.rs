pub mod dispatcher;
pub mod registry;
pub mod resources;
pub mod types;

pub use dispatcher::{RequestContext, RequestDispatcher};
pub use registry::ToolRegistry;
pub use resources::ResourceCatalog;
