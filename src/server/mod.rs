//! Assembling and running the signer.
use std::{sync::Arc, time::Duration};

use crate::{
    commons::{util::file, SignerResult},
    config::Config,
    device::{drivers::softtoken::SoftTokenDriver, DeviceProvider, DeviceRouter},
    handlers::SignerContext,
    tokens::TokenManager,
};

#[cfg(feature = "hsm")]
use crate::device::drivers::hsm::{CryptokiModule, HsmDriver};

mod dispatcher;
pub use self::dispatcher::Dispatcher;

mod service;
pub use self::service::{ServiceHandle, SignerService};

/// How long executing requests may take to finish at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Loads the registry and sets up the configured drivers.
///
/// Fails if the snapshot exists but cannot be read: the signer must not
/// start with an empty registry by accident. The drivers are polled once,
/// a device that cannot be reached is logged and picked up by a later
/// refresh.
pub fn build_context(config: &Config) -> SignerResult<SignerContext> {
    file::create_dir(&config.data_dir)?;

    let tokens = TokenManager::build(&config.data_dir)?;
    info!(
        "Loaded {} tokens from {}",
        tokens.tokens()?.len(),
        config.data_dir.to_string_lossy()
    );

    let devices = DeviceRouter::build(build_providers(config)?)?;
    let context = SignerContext::new(Arc::new(tokens), Arc::new(devices));

    if let Err(e) = context.sync_devices() {
        warn!("Not all devices could be synced at startup: {}", e);
    }

    Ok(context)
}

fn build_providers(config: &Config) -> SignerResult<Vec<DeviceProvider>> {
    let mut providers = vec![];

    if config.soft_token_enabled {
        let driver = SoftTokenDriver::build(&config.data_dir, config.softtoken_pbkdf2_iterations)?;
        providers.push(DeviceProvider::SoftToken(driver));
    }

    #[cfg(feature = "hsm")]
    for module in &config.pkcs11_modules {
        let library = CryptokiModule::load(&module.lib_path)?;
        providers.push(DeviceProvider::Hsm(HsmDriver::new(&module.name, Arc::new(library))));
    }

    #[cfg(not(feature = "hsm"))]
    if !config.pkcs11_modules.is_empty() {
        warn!("Ignoring pkcs11_modules: this build does not include the hsm feature");
    }

    Ok(providers)
}

/// Builds the signer and starts its workers.
///
/// Must be called from within a tokio runtime.
pub fn start(config: &Config) -> SignerResult<SignerService> {
    let context = build_context(config)?;
    let dispatcher = Arc::new(Dispatcher::new(context));
    Ok(SignerService::start(dispatcher, config.workers))
}
