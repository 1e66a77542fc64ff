pub mod agent;
pub mod cancellation;
pub mod capabilities;
pub mod catalog;
pub mod errors;
pub mod events;
pub mod models;
pub mod prompt_template;
pub mod providers;
pub mod registry;
pub mod store;
