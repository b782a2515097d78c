pub mod settings;

pub use settings::{generate_default_config, EngineSettings, LoggingSettings, Settings};
