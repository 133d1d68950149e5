pub mod accounts;
pub mod analytics;
pub mod canonical;
pub mod config;
pub mod db;
pub mod dead_letters;
pub mod error;
pub mod extract;
pub mod jobs;
pub mod models;
pub mod normalize;
pub mod provider;
pub mod reconcile;
pub mod routes;
pub mod s3;
pub mod schema;
pub mod state;
pub mod storage;
pub mod utils {
    pub mod json;
}
pub mod workers;

pub use workers::{default_handlers, Worker};
