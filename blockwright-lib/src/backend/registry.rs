//! Compile-time registry mapping names to backend constructors (spec
//! §9: "shared per-backend dispatch table → static registry", replacing
//! nbdkit's `dlopen` of `.so` plugins).

use super::{Filter, Plugin};
use crate::filters;
use crate::plugins;
use crate::BlockwrightError;

type PluginCtor = fn() -> Box<dyn Plugin>;
type FilterCtor = fn() -> Box<dyn Filter>;

const PLUGINS: &[(&str, PluginCtor)] =
    &[("memory", || Box::new(plugins::memory::MemoryPlugin::new())), ("random", || Box::new(plugins::random::RandomPlugin::new()))];

const FILTERS: &[(&str, FilterCtor)] = &[
    ("offset", || Box::new(filters::offset::OffsetFilter::new())),
    ("limit", || Box::new(filters::limit::LimitFilter::new())),
    ("ip", || Box::new(filters::ip::IpFilter::new())),
    ("cacheextents", || Box::new(filters::cacheextents::CacheExtentsFilter::new())),
    ("exportname", || Box::new(filters::exportname::ExportnameFilter::new())),
    ("error", || Box::new(filters::error_injection::ErrorInjectionFilter::new())),
    ("rate-limit", || Box::new(filters::rate_limit::RateLimitFilter::new())),
];

pub fn construct_plugin(name: &str) -> Result<Box<dyn Plugin>, BlockwrightError> {
    PLUGINS.iter().find(|(n, _)| *n == name).map(|(_, ctor)| ctor()).ok_or_else(|| BlockwrightError::UnknownBackend(name.to_string()))
}

pub fn construct_filter(name: &str) -> Result<Box<dyn Filter>, BlockwrightError> {
    FILTERS.iter().find(|(n, _)| *n == name).map(|(_, ctor)| ctor()).ok_or_else(|| BlockwrightError::UnknownBackend(name.to_string()))
}

pub fn known_plugin_names() -> impl Iterator<Item = &'static str> {
    PLUGINS.iter().map(|(n, _)| *n)
}

pub fn known_filter_names() -> impl Iterator<Item = &'static str> {
    FILTERS.iter().map(|(n, _)| *n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_known_plugins() {
        assert!(construct_plugin("memory").is_ok());
        assert!(construct_plugin("random").is_ok());
        assert!(construct_plugin("nonexistent").is_err());
    }

    #[test]
    fn constructs_known_filters() {
        for name in known_filter_names() {
            assert!(construct_filter(name).is_ok());
        }
    }
}
