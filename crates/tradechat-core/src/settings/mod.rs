pub mod chat_settings;
pub mod settings_json_repository;
pub mod settings_repository;

pub use chat_settings::ChatSettings;
pub use settings_json_repository::SettingsJsonRepository;
pub use settings_repository::SettingsRepository;
