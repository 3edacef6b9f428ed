pub mod config;
pub mod provider;
pub mod remote;
pub mod terabox;
pub mod upload;
