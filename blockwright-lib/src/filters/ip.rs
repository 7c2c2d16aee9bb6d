//! Allow/deny clients by address, matching the connecting peer against
//! an allowlist or a denylist of CIDR networks.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::RwLock;

use ipnet::IpNet;

use crate::backend::{Backend, Filter};
use crate::context::Context;
use crate::error::Errno;
use crate::BlockwrightError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Disabled,
    Allowlist,
    Denylist,
}

pub struct IpFilter {
    mode: RwLock<Mode>,
    allowlist: RwLock<Vec<IpNet>>,
    denylist: RwLock<Vec<IpNet>>,
}

impl IpFilter {
    pub fn new() -> Self {
        Self { mode: RwLock::new(Mode::Disabled), allowlist: RwLock::new(Vec::new()), denylist: RwLock::new(Vec::new()) }
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        match *self.mode.read().unwrap() {
            Mode::Disabled => true,
            Mode::Allowlist => {
                let list = self.allowlist.read().unwrap();
                if list.is_empty() {
                    return false;
                }
                list.iter().any(|net| net.contains(&ip))
            }
            Mode::Denylist => {
                let list = self.denylist.read().unwrap();
                if list.is_empty() {
                    return true;
                }
                !list.iter().any(|net| net.contains(&ip))
            }
        }
    }
}

impl Default for IpFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for IpFilter {
    fn name(&self) -> &str {
        "ip"
    }

    fn config(&self, key: &str, value: &str, next: &Backend) -> Result<(), BlockwrightError> {
        match key {
            "allow" => {
                let net = IpNet::from_str(value).map_err(|_| BlockwrightError::Config(format!("ip: invalid network {value:?}")))?;
                *self.mode.write().unwrap() = Mode::Allowlist;
                self.allowlist.write().unwrap().push(net);
                Ok(())
            }
            "deny" => {
                let net = IpNet::from_str(value).map_err(|_| BlockwrightError::Config(format!("ip: invalid network {value:?}")))?;
                *self.mode.write().unwrap() = Mode::Denylist;
                self.denylist.write().unwrap().push(net);
                Ok(())
            }
            other => next.config(other, value),
        }
    }

    fn open(&self, next: &Backend, readonly: bool, exportname: &str, using_tls: bool, peer: Option<IpAddr>) -> Result<Context, Errno> {
        if let Some(ip) = peer {
            if !self.is_allowed(ip) {
                return Err(Errno::Perm);
            }
        }
        let next_ctx = next.open(readonly, exportname, using_tls, peer)?;
        Ok(Context::new(Box::new(()), Some(Box::new(next_ctx))))
    }
}
