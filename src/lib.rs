pub mod cli;
pub mod coin;
pub mod config;
pub mod db;
pub mod error;
pub mod explorer;
pub mod pay;
pub mod sync;
pub mod txdetails;
pub mod types;
pub mod utils;


pub use cli::cli_main;
pub use coin::CoinDef;
pub use error::{Error, Result};
pub use sync::{SyncConfig, SyncEngine, SyncEvent};
pub use utils::init_tracing;
