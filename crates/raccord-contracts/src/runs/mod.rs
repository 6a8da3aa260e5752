pub mod prompt_history;
pub mod receipts;
pub mod scene_history;
pub mod summary;
