pub mod config;
pub mod db;
pub mod dtos;
pub mod mail;
pub mod models;
pub mod service;
pub mod utils;
