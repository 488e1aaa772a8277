// App-specific submission handlers, registered at startup
pub mod app_a;

pub use app_a::register_app_a_jobs;
