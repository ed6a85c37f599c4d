//! Browser automation module
//!
//! One Chrome process per account pass, driven over CDP. `session` owns the
//! process, `actions` adapts it to the search campaign's traits.

mod actions;
mod errors;
mod session;

pub use actions::{fetch_dashboard, LiveSearchPage, PORTAL_URL};
pub use errors::BrowserError;
pub use session::{session_dir, BrowserSession, BrowserSessionConfig};
