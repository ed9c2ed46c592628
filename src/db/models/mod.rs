//! Database models, one file per table family.
//! Everything is re-exported at `crate::db::models` (and `crate::db`).

pub mod analytics;
pub mod criteria;
pub mod delivery;
pub mod delivery_queue;
pub mod notice;
pub mod role;
pub mod user;

pub use self::analytics::*;
pub use self::criteria::*;
pub use self::delivery::*;
pub use self::delivery_queue::*;
pub use self::notice::*;
pub use self::role::*;
pub use self::user::*;
