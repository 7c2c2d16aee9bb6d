//! Rewrites and filters the export list and/or forces resolution of the
//! default-export sentinel. A script-driven description mode (shelling
//! out to an external command to compute descriptions) is intentionally
//! not supported here — no subprocess execution — in favor of
//! `keep`/`none`/`fixed:...`.

use std::sync::RwLock;

use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::export::ExportsSet;
use crate::BlockwrightError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListMode {
    Keep,
    Error,
    Empty,
    DefaultOnly,
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DescMode {
    Keep,
    None,
    Fixed(String),
}

pub struct ExportnameFilter {
    default_export: RwLock<Option<String>>,
    list_mode: RwLock<ListMode>,
    strict: RwLock<bool>,
    explicit: RwLock<Vec<(String, Option<String>)>>,
    desc_mode: RwLock<DescMode>,
}

impl ExportnameFilter {
    pub fn new() -> Self {
        Self {
            default_export: RwLock::new(None),
            list_mode: RwLock::new(ListMode::Keep),
            strict: RwLock::new(false),
            explicit: RwLock::new(Vec::new()),
            desc_mode: RwLock::new(DescMode::Keep),
        }
    }

    fn describe(&self, name: &str, inherited: Option<String>) -> Option<String> {
        let _ = name;
        match &*self.desc_mode.read().unwrap() {
            DescMode::Keep => inherited,
            DescMode::None => None,
            DescMode::Fixed(s) => Some(s.clone()),
        }
    }
}

impl Default for ExportnameFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for ExportnameFilter {
    fn name(&self) -> &str {
        "exportname"
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        match key {
            "default-export" | "default_export" => {
                *self.default_export.write().unwrap() = Some(value.to_string());
                Ok(())
            }
            "exportname-list" | "exportname_list" => {
                let mode = match value {
                    "keep" => ListMode::Keep,
                    "error" => ListMode::Error,
                    "empty" => ListMode::Empty,
                    "defaultonly" | "default-only" => ListMode::DefaultOnly,
                    "explicit" => ListMode::Explicit,
                    other => return Err(BlockwrightError::Config(format!("exportname: unrecognized exportname-list mode {other:?}"))),
                };
                *self.list_mode.write().unwrap() = mode;
                Ok(())
            }
            "exportname-strict" | "exportname_strict" => {
                let v: bool = value.parse().map_err(|_| BlockwrightError::Config(format!("exportname: invalid bool {value:?}")))?;
                *self.strict.write().unwrap() = v;
                Ok(())
            }
            "exportname" => {
                self.explicit.write().unwrap().push((value.to_string(), None));
                Ok(())
            }
            "exportdesc" => {
                let mode = match value {
                    "keep" => DescMode::Keep,
                    "none" => DescMode::None,
                    other => match other.strip_prefix("fixed:") {
                        Some(rest) => DescMode::Fixed(rest.to_string()),
                        None => return Err(BlockwrightError::Config(format!("exportname: unrecognized exportdesc mode {other:?}"))),
                    },
                };
                *self.desc_mode.write().unwrap() = mode;
                Ok(())
            }
            other => next.config(other, value),
        }
    }

    fn open(&self, next: &Backend, readonly: bool, exportname: &str, using_tls: bool, peer: Option<std::net::IpAddr>) -> Result<Context, Errno> {
        if *self.strict.read().unwrap() {
            let known = self.explicit.read().unwrap();
            if !known.iter().any(|(name, _)| name == exportname) {
                return Err(Errno::Inval);
            }
        }
        let next_ctx = next.open(readonly, exportname, using_tls, peer)?;
        Ok(Context::new(Box::new(()), Some(Box::new(next_ctx))))
    }

    fn list_exports(&self, next: &Backend, readonly: bool, using_tls: bool, out: &mut ExportsSet) -> Result<(), Errno> {
        match *self.list_mode.read().unwrap() {
            ListMode::Keep => next.list_exports(readonly, using_tls, out),
            ListMode::Error => Err(Errno::Perm),
            ListMode::Empty => Ok(()),
            ListMode::DefaultOnly => out.use_default().map_err(|_| Errno::Io),
            ListMode::Explicit => {
                for (name, desc) in self.explicit.read().unwrap().iter() {
                    let desc = self.describe(name, desc.clone());
                    out.add(name.clone(), desc).map_err(|_| Errno::Io)?;
                }
                Ok(())
            }
        }
    }

    fn default_export(&self, next: &Backend, readonly: bool, using_tls: bool) -> Option<String> {
        if *self.strict.read().unwrap() {
            let has_empty_export = self.explicit.read().unwrap().iter().any(|(name, _)| name.is_empty());
            return if has_empty_export { Some(self.default_export.read().unwrap().clone().unwrap_or_default()) } else { None };
        }
        if let Some(name) = self.default_export.read().unwrap().clone() {
            return Some(name);
        }
        next.default_export(readonly, using_tls)
    }

    fn export_description(&self, next: &Backend, ctx: &mut Context) -> Option<String> {
        let inherited = if *self.desc_mode.read().unwrap() == DescMode::Keep { next.export_description(ctx.next_mut()?) } else { None };
        self.describe("", inherited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::memory::MemoryPlugin;

    fn pipeline() -> (ExportnameFilter, Backend) {
        (ExportnameFilter::new(), Backend::plugin(MemoryPlugin::new()))
    }

    #[test]
    fn explicit_mode_lists_only_configured_exports() {
        let (filter, plugin_backend) = pipeline();
        filter.config("exportname-list", "explicit", &plugin_backend).unwrap();
        filter.config("exportname", "alpha", &plugin_backend).unwrap();
        filter.config("exportname", "beta", &plugin_backend).unwrap();
        let backend = Backend::filter(filter, 1, plugin_backend);

        let mut out = ExportsSet::new();
        backend.list_exports(false, false, &mut out).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn strict_mode_rejects_unknown_export_names() {
        let (filter, plugin_backend) = pipeline();
        filter.config("exportname-strict", "true", &plugin_backend).unwrap();
        filter.config("exportname", "alpha", &plugin_backend).unwrap();
        let backend = Backend::filter(filter, 1, plugin_backend);

        assert!(backend.open(false, "alpha", false, None).is_ok());
        assert_eq!(backend.open(false, "bogus", false, None).unwrap_err(), Errno::Inval);
    }

    #[test]
    fn default_export_override_takes_precedence() {
        let (filter, plugin_backend) = pipeline();
        filter.config("default-export", "primary", &plugin_backend).unwrap();
        let backend = Backend::filter(filter, 1, plugin_backend);
        assert_eq!(backend.default_export(false, false), Some("primary".to_string()));
    }
}
