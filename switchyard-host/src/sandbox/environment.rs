//! Environment composition for sandboxed runs.

use std::collections::BTreeMap;
use switchyard_shared::SandboxEnvironmentDefinition;

/// Host process variables that are valid UTF-8, or nothing when inheritance is off.
pub fn ambient_environment(inherit: bool) -> Vec<(String, String)> {
    if !inherit {
        return Vec::new();
    }
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// Layer the three sources; later layers win on key collision:
/// ambient ← referenced environment ← script's own `env`.
pub fn compose_environment<I>(
    ambient: I,
    environment: Option<&SandboxEnvironmentDefinition>,
    script_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut merged: BTreeMap<String, String> = ambient.into_iter().collect();
    if let Some(environment) = environment {
        merged.extend(
            environment
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }
    merged.extend(script_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn script_env_wins_over_environment_wins_over_ambient() {
        let ambient = vec![
            ("HOME".to_string(), "/home/op".to_string()),
            ("REGION".to_string(), "ambient".to_string()),
            ("LEVEL".to_string(), "ambient".to_string()),
        ];
        let environment = SandboxEnvironmentDefinition {
            id: "prod".into(),
            name: "Production".into(),
            description: None,
            variables: map(&[("REGION", "eu-west"), ("LEVEL", "env"), ("TOKEN", "t")]),
        };
        let script = map(&[("LEVEL", "script")]);

        let merged = compose_environment(ambient, Some(&environment), &script);
        assert_eq!(merged["HOME"], "/home/op");
        assert_eq!(merged["REGION"], "eu-west");
        assert_eq!(merged["TOKEN"], "t");
        assert_eq!(merged["LEVEL"], "script");
    }

    #[test]
    fn no_environment_reference_is_ambient_plus_script() {
        let merged = compose_environment(
            vec![("A".to_string(), "1".to_string())],
            None,
            &map(&[("B", "2")]),
        );
        assert_eq!(merged, map(&[("A", "1"), ("B", "2")]));
    }

    #[test]
    fn disabled_inheritance_yields_nothing() {
        assert!(ambient_environment(false).is_empty());
    }
}
