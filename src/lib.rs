pub mod activity;
pub mod auth;
pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod mail;
pub mod models;
pub mod remote;
pub mod requests;
pub mod routes;
pub mod routing;
pub mod schema;
pub mod state;
pub mod storage;
pub mod tokens;
pub mod workers;
