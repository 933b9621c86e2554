//! Storage backends.
//!
//! - [`traits`]: the three collaborator contracts ([`SharedCache`](traits::SharedCache),
//!   [`StructuredStore`](traits::StructuredStore), [`TabularStore`](traits::TabularStore))
//! - [`redis`]: shared cache on Redis
//! - [`sql`]: structured store on MySQL/SQLite via sqlx
//! - [`memory`]: in-process implementations of all three
//! - [`tiered`]: shared cache with a degraded local tier

pub mod traits;
pub mod memory;
pub mod redis;
pub mod sql;
pub mod tiered;
