// Copyright 2018 the hostfw developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! Configuration types for the daemon binary.

use errors::*;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Seconds between garbage-collection passes.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Tables to manage; one updater is spawned per entry.
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

/// One `(table, IP version)` pair to manage.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Name of the iptables table, e.g. `filter`.
    pub table: String,

    /// Manage the IPv6 variant of the table instead of the IPv4 one.
    #[serde(default)]
    pub ipv6: bool,
}

fn default_cleanup_interval() -> u64 {
    60
}

/// Load a configuration from a TOML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    Ok(::toml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config: Config = ::toml::from_str(
            r#"
            [[tables]]
            table = "filter"
        "#,
        ).unwrap();
        assert_eq!(config.cleanup_interval_secs, 60);
        assert_eq!(config.tables.len(), 1);
        assert_eq!(config.tables[0].table, "filter");
        assert!(!config.tables[0].ipv6);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = ::toml::from_str(
            r#"
            cleanup_interval_secs = 30

            [[tables]]
            table = "filter"

            [[tables]]
            table = "filter"
            ipv6 = true
        "#,
        ).unwrap();
        assert_eq!(config.cleanup_interval_secs, 30);
        assert_eq!(config.tables.len(), 2);
        assert!(config.tables[1].ipv6);
    }
}
