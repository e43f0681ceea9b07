pub mod config;
pub mod login;
pub mod render;

pub use config::{load_terminal_settings, save_terminal_settings, TerminalSettings};
pub use login::ensure_signed_in;
pub use render::{describe_failure, TerminalObserver};
