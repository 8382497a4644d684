pub mod app;
pub mod codeship;
pub mod config;
pub mod engine;
pub mod settings;
