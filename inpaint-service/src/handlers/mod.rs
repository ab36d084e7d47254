pub mod health;
pub mod inpaint;
pub mod results;

pub use health::{health_check, home, metrics, readiness};
pub use inpaint::{inpaint, method_hint};
pub use results::{download_blob, get_result, list_results};
