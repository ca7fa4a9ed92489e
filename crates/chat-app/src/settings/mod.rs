pub mod state;

pub use state::{ServiceSettings, SettingsError, SettingsStore};
