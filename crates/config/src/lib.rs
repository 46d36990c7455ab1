//! Configuration for tokenward: discovery, env substitution and the schema.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{
        clear_config_dir, config_dir, credential_store_path, data_dir, discover_and_load,
        find_or_default_config_path, load_config, load_or_discover, save_config_to,
        set_config_dir, update_config,
    },
    schema::{
        ConnectionConfig, ManagerSettings, ProviderEntry, ProvidersConfig, RetrySettings,
        StoreSettings, TokenwardConfig,
    },
};
