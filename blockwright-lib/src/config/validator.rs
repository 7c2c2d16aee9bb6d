//! Eager, fail-before-serving validation: collect every problem class
//! up front, return one typed error, and abort startup rather than
//! failing mid-handshake.

use crate::backend::registry;
use crate::config::cli::RawPipeline;
use crate::BlockwrightError;

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn validate(raw: &RawPipeline) -> Result<(), BlockwrightError> {
    if !valid_name(&raw.plugin.name) {
        return Err(BlockwrightError::Config(format!("invalid plugin name {:?}", raw.plugin.name)));
    }
    if registry::construct_plugin(&raw.plugin.name).is_err() {
        return Err(BlockwrightError::UnknownBackend(raw.plugin.name.clone()));
    }

    for filter in &raw.filters {
        if !valid_name(&filter.name) {
            return Err(BlockwrightError::Config(format!("invalid filter name {:?}", filter.name)));
        }
        if registry::construct_filter(&filter.name).is_err() {
            return Err(BlockwrightError::UnknownBackend(filter.name.clone()));
        }
    }

    Ok(())
}
