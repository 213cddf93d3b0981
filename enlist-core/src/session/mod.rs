mod error;
mod human;
mod launcher;

pub use error::{SessionError, SessionResult};
pub use human::InputPacer;
pub use launcher::{
    BrowserLauncher, ChromiumSession, ChromiumSessionFactory, DrivenBrowser, LaunchOverrides,
    SessionFactory, SignupSession,
};
