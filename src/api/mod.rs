pub mod models;
pub mod vision;
