pub mod config;
pub mod db;
pub mod filters;
pub mod graph;
pub mod job;
pub mod models;
pub mod rating;
pub mod repos;
pub mod services;

pub use services::cancellation_job::RatingCancellationJob;
pub use services::rerate_dispatcher::RerateDispatcherJob;
