pub mod database;
pub mod metrics;
pub mod storage;

pub use database::Database;
pub use self::metrics::{get_metrics, init_metrics};
pub use storage::{LocalStorage, Storage};
