//! Terminal screens for the command line tools.

mod device_selector;
mod error;
mod status_screen;

pub use device_selector::device_selector;
pub use error::GuiError;
pub use status_screen::run_until_keypress;
