pub mod config;
pub mod error;

pub use config::{load_dotenv, LoopConfig};
pub use error::*;
