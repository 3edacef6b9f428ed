use std::collections::BTreeMap;
use std::sync::Arc;

use terabox_core::{TeraboxClient, TeraboxError};
use thiserror::Error;

use crate::config::UploadConfig;
use crate::remote::RemoteStorage;
use crate::terabox::TeraboxStorage;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider `{name}`; available: {available}")]
    Unknown { name: String, available: String },
    #[error("provider `{provider}` requires {variable} to be set")]
    MissingCredential {
        provider: &'static str,
        variable: &'static str,
    },
    #[error("client error: {0}")]
    Client(#[from] TeraboxError),
}

pub type ProviderFactory = fn(&UploadConfig) -> Result<Arc<dyn RemoteStorage>, ProviderError>;

/// Storage backends by name, resolved once at startup.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: BTreeMap<&'static str, ProviderFactory>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("terabox", terabox_provider);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: ProviderFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factories.keys().copied().collect()
    }

    pub fn resolve(&self, config: &UploadConfig) -> Result<Arc<dyn RemoteStorage>, ProviderError> {
        let factory = self
            .factories
            .get(config.provider.as_str())
            .ok_or_else(|| ProviderError::Unknown {
                name: config.provider.clone(),
                available: self.names().join(", "),
            })?;
        factory(config)
    }
}

fn terabox_provider(config: &UploadConfig) -> Result<Arc<dyn RemoteStorage>, ProviderError> {
    let ndus = config
        .ndus
        .clone()
        .ok_or(ProviderError::MissingCredential {
            provider: "terabox",
            variable: "TBUP_NDUS",
        })?;
    let client = TeraboxClient::with_base_url(&config.base_url, ndus)?;
    Ok(Arc::new(TeraboxStorage::new(client)))
}
