pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod index;
pub mod keywords;
pub mod models;
pub mod moderation;
pub mod repeat;
pub mod selector;
pub mod sync;

pub use config::Config;
pub use db::{Database, Store};
pub use engine::{IncomingMessage, Observation, Repeater};
pub use error::{RepeaterError, Result};
pub use moderation::Placement;
pub use sync::{Background, FlushReport};
