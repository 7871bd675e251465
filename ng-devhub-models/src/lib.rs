pub mod address;
pub mod attributes;
pub mod cache;
pub mod dao;
pub mod device;
pub mod driver;
pub mod event;
pub mod message;
pub mod services;
pub mod settings;
pub mod sync;
