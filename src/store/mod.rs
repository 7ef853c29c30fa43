pub mod connections;

pub use connections::{ConnectionManager, ConnectionMode, ConnectionTarget, PoolPolicy, ResourceHandle};
