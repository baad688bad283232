//! Optional `virt64.toml` configuration, layered under the CLI flags.
//!
//! Every field here also has a CLI equivalent; the file only supplies a
//! default when the flag is omitted.

use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub debug: Debug,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Log {
    pub level: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Debug {
    /// Guard against runaway loops in a broken guest image: abort after this
    /// many retired instructions. `None` means run unbounded.
    pub max_instructions: Option<u64>,
}

/// Read `path` if given, else `virt64.toml` in the current directory if one
/// exists. Returns the default configuration (no overrides) if neither is
/// present.
pub fn read_config(path: Option<&Path>) -> Config {
    let default_path = Path::new("virt64.toml").to_owned();
    let path = path.map(Path::to_owned).unwrap_or(default_path);
    match fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text)
            .unwrap_or_else(|e| panic!("failed to parse configuration file {}: {}", path.display(), e)),
        Err(_) => Config::default(),
    }
}
