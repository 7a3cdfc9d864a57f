//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `serve`   | `Serve`          |
//! | `analyze` | `Analyze`        |
//! | `status`  | `Status`         |
//! | `config`  | `Config`         |

pub mod analyze;
pub mod config;
pub mod serve;
pub mod status;

pub use analyze::cmd_analyze;
pub use config::cmd_config;
pub use serve::cmd_serve;
pub use status::cmd_status;
