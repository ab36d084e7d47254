pub mod config;
pub mod dtos;
pub mod handlers;
pub mod inference;
pub mod models;
pub mod services;
pub mod startup;
