//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `run`    | `Run`            |
//! | `exec`   | `Exec`           |
//! | `audit`  | `Audit`          |
//! | `wiring` | shared setup     |

pub mod audit;
pub mod exec;
pub mod run;
pub mod serve;
pub mod wiring;

pub use audit::cmd_audit;
pub use exec::cmd_exec;
pub use run::cmd_run;
pub use serve::cmd_serve;
