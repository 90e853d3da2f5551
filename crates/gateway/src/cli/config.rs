//! `drydock config …` subcommands.

use dd_domain::config::{Config, ConfigSeverity};

/// Print every validation issue; returns false if any is an error.
pub fn validate(config: &Config) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config OK");
        return true;
    }
    for issue in &issues {
        println!("{issue}");
    }
    !issues
        .iter()
        .any(|i| i.severity == ConfigSeverity::Error)
}

/// Dump the effective config (file + env overrides) as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => print!("{rendered}"),
        Err(e) => eprintln!("failed to render config: {e}"),
    }
}
