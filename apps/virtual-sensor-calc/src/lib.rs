pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod services;
pub mod store;
