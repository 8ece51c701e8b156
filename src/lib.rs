//! Moves MetisAgent user data out of the legacy document collection into
//! the relational `users` / `user_attributes` store.

pub mod config;
pub mod error;
pub mod inspect;
pub mod legacy;
pub mod logging;
pub mod migration;
pub mod prompt;
pub mod target;
pub mod time;
pub mod util;

pub use error::{AppError, AppResult};
