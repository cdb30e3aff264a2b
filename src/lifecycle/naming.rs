//! VM names inside a user's pool

use crate::config::validation::MAX_MACHINE_NAME_LEN;
use crate::config::MachineSpec;

/// Replace anything outside `[A-Za-z0-9_-]`, cap the length and make sure
/// the name starts with an alphanumeric character.
pub fn sanitize_machine_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name = format!("vm_{}", name);
    }
    name.truncate(MAX_MACHINE_NAME_LEN);
    name
}

/// Configured name, or `vm-{template_vmid}-{pool}`
pub fn machine_name(spec: &MachineSpec, pool: &str) -> String {
    let raw = match spec.name.as_deref() {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => format!("vm-{}-{}", spec.template_vmid, pool),
    };
    sanitize_machine_name(&raw)
}

/// Names for a whole stand. Repeats get a `-{n}` suffix so two machines
/// from the same template do not shadow each other.
pub fn stand_machine_names<'a>(
    specs: impl IntoIterator<Item = &'a MachineSpec>,
    pool: &str,
) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for spec in specs {
        let base = machine_name(spec, pool);
        let mut candidate = base.clone();
        let mut n = 2;
        while names.contains(&candidate) {
            let suffix = format!("-{}", n);
            let keep = MAX_MACHINE_NAME_LEN.saturating_sub(suffix.len()).min(base.len());
            candidate = format!("{}{}", &base[..keep], suffix);
            n += 1;
        }
        names.push(candidate);
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_machine_name("web server.1"), "web_server_1");
        assert_eq!(sanitize_machine_name("_hidden"), "vm__hidden");
        assert_eq!(sanitize_machine_name("ok-name_1"), "ok-name_1");
        assert_eq!(sanitize_machine_name(&"a".repeat(60)).len(), 40);
    }

    #[test]
    fn test_default_name() {
        let spec = MachineSpec::new(100, "pve1");
        assert_eq!(machine_name(&spec, "alice"), "vm-100-alice");
        let named = MachineSpec::new(100, "pve1").with_name("router");
        assert_eq!(machine_name(&named, "alice"), "router");
    }

    #[test]
    fn test_repeated_names_get_suffix() {
        let specs = vec![
            MachineSpec::new(100, "pve1"),
            MachineSpec::new(100, "pve1"),
            MachineSpec::new(101, "pve1"),
            MachineSpec::new(100, "pve1"),
        ];
        assert_eq!(
            stand_machine_names(&specs, "bob"),
            vec!["vm-100-bob", "vm-100-bob-2", "vm-101-bob", "vm-100-bob-3"]
        );
    }
}
