pub mod config;
pub mod domain;
pub mod error;
pub mod fsio;
pub mod ingest;
pub mod integrity;
pub mod normalize;
pub mod people;
pub mod store;
