pub mod catalog;
pub mod config;
pub mod platform;
pub mod prefs;
pub mod protocol;
pub mod recent;
pub mod state;
