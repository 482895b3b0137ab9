pub mod app_state;
pub mod audio;
pub mod canvas;
pub mod config;
pub mod download;
pub mod job;
pub mod layout;
pub mod loopback;
pub mod probe;
pub mod process_pool;
pub mod s3;
pub mod server;
pub mod thumbnail;
pub mod timeline;
pub mod tracing;
pub mod transcode;
pub mod utils;
pub mod worker;

pub use app_state::AppState;
pub use job::JobRegistry;
pub use process_pool::ProcessPool;
