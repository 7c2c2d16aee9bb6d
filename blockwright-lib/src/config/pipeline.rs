//! Resolves a parsed [`RawPipeline`] against the static backend
//! registry (spec §9: "shared per-backend dispatch table → static
//! registry") into a constructed [`Backend`] chain, configuring each
//! node as soon as it becomes the outermost layer so an unrecognized
//! `key=value` still reaches the right node: `Backend::config`
//! dispatches to that layer's own `Filter::config`/`Plugin::config`,
//! which only forwards inward on keys it doesn't recognize.

use crate::backend::registry;
use crate::backend::Backend;
use crate::config::cli::RawPipeline;
use crate::BlockwrightError;

pub fn build_pipeline(raw: &RawPipeline) -> Result<Backend, BlockwrightError> {
    let plugin = registry::construct_plugin(&raw.plugin.name)?;
    let mut backend = Backend::plugin_boxed(plugin);
    for (key, value) in &raw.plugin.params {
        backend.config(key, value)?;
    }

    for (index, spec) in raw.filters.iter().enumerate() {
        let filter = registry::construct_filter(&spec.name)?;
        backend = Backend::filter_boxed(filter, index as u32 + 1, backend);
        for (key, value) in &spec.params {
            backend.config(key, value)?;
        }
    }

    Ok(backend)
}
