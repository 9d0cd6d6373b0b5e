pub mod state;

pub use state::{
    ChatSettings, Credentials, DEFAULT_REQUEST_TIMEOUT_SECS, ENV_PREFIX, SETTINGS_DIRECTORY_NAME,
    SETTINGS_FILE_NAME, SettingsError, SettingsStore,
};
