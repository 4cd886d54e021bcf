mod settings;

use config::{Config, Environment, File};

use crate::utils::RelayResult;
use settings::PartialSettings;

pub use settings::{BasicAuthSettings, RabbitSettings, ServerSettings, Settings, WorkerSettings};

/// Loads the configuration from `.env`, the optional `config/default` file
/// and environment variables, in increasing order of precedence.
/// Anything left unset falls back to `Settings::default()`. Values stay
/// strings until deserialization, so only numeric fields are parsed.
pub fn load_config() -> RelayResult<Settings> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default());

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
