pub mod app;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod install;
pub mod lock;
pub mod picker;
pub mod session;
pub mod terminal;
pub mod token;
pub mod util;
