//! Export bundle: the merged, exported view of context/location/env,
//! rendered to zero or more configured files.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferredIpVersion {
    V4,
    V6,
}

impl Default for PreferredIpVersion {
    fn default() -> Self {
        PreferredIpVersion::V4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalarField {
    Context,
    Location,
    PublicIp,
    PublicIpv4,
    PublicIpv6,
    LocalIpv4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportShape {
    Dotenv,
    Scalar(ScalarField),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportTarget {
    pub path: PathBuf,
    pub shape: ExportShape,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExportBundle {
    pub context: String,
    pub location: String,
    pub public_ip: Option<IpAddr>,
    pub public_ipv4: Option<IpAddr>,
    pub public_ipv6: Option<IpAddr>,
    pub local_ipv4: Option<IpAddr>,
    pub environment: BTreeMap<String, String>,
}

impl ExportBundle {
    pub fn new(
        context: impl Into<String>,
        location: impl Into<String>,
        preferred: PreferredIpVersion,
        public_ipv4: Option<IpAddr>,
        public_ipv6: Option<IpAddr>,
        local_ipv4: Option<IpAddr>,
        environment: BTreeMap<String, String>,
    ) -> Self {
        let public_ip = match preferred {
            PreferredIpVersion::V4 => public_ipv4.or(public_ipv6),
            PreferredIpVersion::V6 => public_ipv6.or(public_ipv4),
        };
        Self { context: context.into(), location: location.into(), public_ip, public_ipv4, public_ipv6, local_ipv4, environment }
    }

    fn built_ins(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("OVERSEER_CONTEXT".to_string(), self.context.clone());
        m.insert("OVERSEER_LOCATION".to_string(), self.location.clone());
        if let Some(ip) = self.public_ip {
            m.insert("OVERSEER_PUBLIC_IP".to_string(), ip.to_string());
        }
        if let Some(ip) = self.public_ipv4 {
            m.insert("OVERSEER_PUBLIC_IPV4".to_string(), ip.to_string());
        }
        if let Some(ip) = self.public_ipv6 {
            m.insert("OVERSEER_PUBLIC_IPV6".to_string(), ip.to_string());
        }
        if let Some(ip) = self.local_ipv4 {
            m.insert("OVERSEER_LOCAL_IPV4".to_string(), ip.to_string());
        }
        m
    }

    /// Render the dotenv shape: every built-in `OVERSEER_*` plus the
    /// merged overlay, keys sorted, values double-quoted. Keys present in
    /// `previous_overlay` but absent from the current overlay are
    /// emitted as `unset KEY` so a shell re-sourcing the file cleans up
    /// stale exports.
    pub fn render_dotenv(&self, previous_overlay: &BTreeMap<String, String>) -> String {
        let mut all = self.built_ins();
        all.extend(self.environment.clone());

        let mut out = String::new();
        for (k, v) in &all {
            out.push_str(&format!("{k}=\"{}\"\n", escape_dotenv_value(v)));
        }
        for k in previous_overlay.keys() {
            if !self.environment.contains_key(k) {
                out.push_str(&format!("unset {k}\n"));
            }
        }
        out
    }

    pub fn render_scalar(&self, field: ScalarField) -> String {
        let value = match field {
            ScalarField::Context => self.context.clone(),
            ScalarField::Location => self.location.clone(),
            ScalarField::PublicIp => self.public_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            ScalarField::PublicIpv4 => self.public_ipv4.map(|ip| ip.to_string()).unwrap_or_default(),
            ScalarField::PublicIpv6 => self.public_ipv6.map(|ip| ip.to_string()).unwrap_or_default(),
            ScalarField::LocalIpv4 => self.local_ipv4.map(|ip| ip.to_string()).unwrap_or_default(),
        };
        format!("{value}\n")
    }
}

fn escape_dotenv_value(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}
