pub mod graph;
pub mod keys;
pub mod receiver;
pub mod relay;
pub mod user_data;
