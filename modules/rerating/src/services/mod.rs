pub mod cancellation_executor;
pub mod cancellation_job;
pub mod chunk_cursor;
pub mod chunking;
pub mod processing_summary;
pub mod rerate_dispatcher;
pub mod view_builder;
