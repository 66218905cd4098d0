pub mod cancellation_repo;
pub mod dispatch_repo;
pub mod graph_cursor_repo;
pub mod graph_view_repo;
pub mod summary_repo;
