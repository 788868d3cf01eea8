use cadence_domain::config::{Config, ConfigSeverity};

/// Parse and validate the config, printing every issue found.
///
/// Returns false when any error-severity issue is present.
pub fn validate(config: &Config, config_path: &str) -> bool {
    let issues = config.validate();
    if issues.is_empty() {
        println!("config OK ({config_path})");
        return true;
    }

    let mut errors = 0;
    for issue in &issues {
        if issue.severity == ConfigSeverity::Error {
            errors += 1;
        }
        println!("{issue}");
    }
    println!(
        "\n{errors} error(s), {} warning(s) in {config_path}",
        issues.len() - errors
    );
    errors == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &Config) {
    match toml::to_string_pretty(config) {
        Ok(rendered) => print!("{rendered}"),
        Err(e) => {
            eprintln!("failed to serialize config: {e}");
            std::process::exit(1);
        }
    }
}
