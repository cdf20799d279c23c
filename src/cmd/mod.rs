//! CLI command implementations.
//!
//! | Module     | Commands handled   |
//! |------------|--------------------|
//! | `serve`    | `Serve` (default)  |
//! | `projects` | `Projects`         |
//! | `config`   | `Config`           |

pub mod config;
pub mod projects;
pub mod serve;

pub use config::cmd_config;
pub use projects::cmd_projects;
pub use serve::cmd_serve;
