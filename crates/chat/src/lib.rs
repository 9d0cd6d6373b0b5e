pub mod conversation;
pub mod history;
pub mod settings;

pub use conversation::{
    Conversation, ExchangeError, PENDING_PLACEHOLDER, SkipReason, SubmitOutcome, ViewTurn,
};
pub use history::{project, project_turn, project_view};
pub use settings::{ChatSettings, Credentials, SettingsError, SettingsStore};
