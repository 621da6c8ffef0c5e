// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `ovxd`.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::Deserialize;

use crate::linkfield::LinkField;
use crate::types::OvxError;
use crate::types::OvxResult;

/// The Config structure captures all of the run-time settings.  Defaults are
/// overridden first by the TOML file named with `--config`, if any, and then
/// by command-line options.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes to
    /// stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: common::logging::LogFormat,

    /// Address on which physical switches are accepted.
    pub of_host: IpAddr,

    /// Port on which physical switches are accepted.
    pub of_port: u16,

    /// Largest number of virtual networks the hypervisor will host.  This
    /// fixes the number of tenant bits in cookies and link fields.
    pub max_virtual_nets: u32,

    /// How virtual links are tagged in the physical network.
    pub link_field: LinkField,

    /// Silence on a channel after which an echo request is sent.
    pub idle_timeout_secs: u64,

    /// Silence on a channel after which it is closed.
    pub read_timeout_secs: u64,

    /// Time allowed for an OpenFlow handshake to complete.
    pub handshake_timeout_secs: u64,

    /// Upper bound on the delay between controller reconnect attempts.
    pub max_backoff_secs: u64,

    /// Number of workers draining the message queue.
    pub worker_threads: usize,

    /// Capacity of the message queue.
    pub queue_depth: usize,

    /// Interval between refreshes of tenant keepalive flows.
    pub link_refresh_secs: u64,

    /// Interval between discovery probe rounds.
    pub probe_interval_ms: u64,

    /// Tenant networks to provision once their switches are up.
    pub tenants: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: common::logging::LogFormat::Human,
            of_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            of_port: common::DEFAULT_OF_PORT,
            max_virtual_nets: 255,
            link_field: LinkField::MacAddress,
            idle_timeout_secs: 20,
            read_timeout_secs: 30,
            handshake_timeout_secs: 15,
            max_backoff_secs: 15,
            worker_threads: 16,
            queue_depth: 1024,
            link_refresh_secs: 25,
            probe_interval_ms: 1000,
            tenants: None,
        }
    }
}

impl Config {
    /// Number of high-order bits used to carry the tenant id.
    pub fn tenant_bits(&self) -> u32 {
        common::bits_needed(self.max_virtual_nets)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn link_refresh(&self) -> Duration {
        Duration::from_secs(self.link_refresh_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    fn validate(&self) -> OvxResult<()> {
        let bits = self.tenant_bits();
        if bits == 0 || (bits >= 12 && self.link_field == LinkField::Vlan) {
            return Err(OvxError::Other(format!(
                "{} virtual networks cannot be encoded in {:?} link fields",
                self.max_virtual_nets, self.link_field
            )));
        }
        if self.worker_threads == 0 || self.queue_depth == 0 {
            return Err(OvxError::Other(
                "worker pool needs at least one worker and one slot"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

// Use the command-line arguments to update the run-time config.
fn update_from_cli(opts: &crate::Opt, config: &mut Config) -> OvxResult<()> {
    if let Some(log_file) = &opts.log_file {
        config.log_file = Some(log_file.to_string());
    }

    if let Some(log_format) = opts.log_format {
        config.log_format = log_format;
    }

    if let Some(of_host) = opts.of_host {
        config.of_host = of_host;
    }

    if let Some(of_port) = opts.of_port {
        config.of_port = of_port;
    }

    if let Some(nets) = opts.max_virtual_nets {
        config.max_virtual_nets = nets;
    }

    if let Some(link_field) = opts.link_field {
        config.link_field = link_field;
    }

    if let Some(workers) = opts.worker_threads {
        config.worker_threads = workers;
    }

    if let Some(depth) = opts.queue_depth {
        config.queue_depth = depth;
    }

    if let Some(tenants) = &opts.tenants {
        config.tenants = Some(tenants.to_string());
    }

    Ok(())
}

fn update_from_file(path: &str, config: &mut Config) -> OvxResult<()> {
    let txt = std::fs::read_to_string(path)?;
    *config = toml::from_str(&txt)
        .map_err(|e| OvxError::Other(format!("failed to parse TOML: {e}")))?;
    Ok(())
}

/// This builds a Config struct containing the tunable settings used to
/// adjust the daemon's behavior.
pub(crate) fn build_config(opts: &crate::Opt) -> OvxResult<Config> {
    let mut config = Config::default();
    if let Some(path) = &opts.config {
        update_from_file(path, &mut config)?;
    }
    update_from_cli(opts, &mut config)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Opt;

    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = build_config(&Opt::default()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.tenant_bits(), 8);
        assert_eq!(config.of_port, 6633);
        assert_eq!(config.idle_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_updates() {
        let opts = Opt {
            log_file: Some("test.log".to_string()),
            of_port: Some(16633),
            link_field: Some(LinkField::Vlan),
            max_virtual_nets: Some(3),
            ..Opt::default()
        };

        let config = build_config(&opts).unwrap();
        assert_eq!(config.log_file, Some("test.log".to_string()));
        assert_eq!(config.of_port, 16633);
        assert_eq!(config.link_field, LinkField::Vlan);
        assert_eq!(config.tenant_bits(), 2);
        assert_eq!(config.queue_depth, 1024);
    }

    #[test]
    fn test_toml_then_cli() {
        let path = std::env::temp_dir()
            .join(format!("ovxd-config-{}.toml", std::process::id()));
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "of_port = 7000\nworker_threads = 4\nlog_format = \"json\"\n\
             link_field = \"vlan\"\nmax_virtual_nets = 7"
        )
        .unwrap();
        drop(f);

        let opts = Opt {
            config: Some(path.display().to_string()),
            worker_threads: Some(2),
            ..Opt::default()
        };
        let config = build_config(&opts).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.of_port, 7000);
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.log_format, common::logging::LogFormat::Json);
        assert_eq!(config.link_field, LinkField::Vlan);
        assert_eq!(config.read_timeout_secs, 30);
    }

    #[test]
    fn test_too_many_tenants_for_vlan() {
        let opts = Opt {
            link_field: Some(LinkField::Vlan),
            max_virtual_nets: Some(4096),
            ..Opt::default()
        };
        assert!(build_config(&opts).is_err());
    }
}
