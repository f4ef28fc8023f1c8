pub mod env_config;
pub mod layout;
pub mod manifest;
pub mod report;
