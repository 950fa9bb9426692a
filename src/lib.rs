// Library for tests to access modules

pub mod alerts;
pub mod changes;
pub mod config;
pub mod fleet;
pub mod health;
pub mod models;
pub mod notify;
pub mod providers;
pub mod routes;
pub mod scheduler;
pub mod snapshot;
pub mod store;
pub mod version;
pub mod window;
