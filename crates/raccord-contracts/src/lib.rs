pub mod events;
pub mod models;
pub mod project;
pub mod runs;
