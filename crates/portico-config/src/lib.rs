//! Portico Config: settings file, data directory layout and the
//! breadcrumb the daemon leaves for local clients.

pub mod breadcrumb;
pub mod dirs;
pub mod error;
pub mod settings;

pub use error::ConfigError;
pub use settings::Settings;
