// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

use std::collections::BTreeMap;

/// How a permission-related setting is rendered on the command line.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionFlag {
    /// `--flag` when the setting is enabled, omitted otherwise.
    Boolean { flag: &'static str, enabled: bool },
    /// `--flag VALUE`, omitted if `value` is `None`.
    Value { flag: &'static str, value: Option<String> },
}

/// Fixed argv template for one agent type: the non-passthrough invocation
/// and the passthrough invocation may differ (e.g. passthrough drops
/// `--print`/JSON-output flags the protocol path needs).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub program: String,
    pub base_args: Vec<String>,
    pub passthrough_base_args: Vec<String>,
    pub model_flag: Option<&'static str>,
    pub resume_flag: Option<&'static str>,
    pub supports_cli_resume: bool,
}

/// Per-request options threaded into [`build`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub passthrough: bool,
    pub model: Option<String>,
    pub initial_prompt: Option<String>,
    pub resume_acp_session_id: Option<String>,
    /// Keyed by setting name; iteration order is sorted lexicographically
    /// by `build` regardless of insertion order, so argv stays deterministic
    /// across processes and across `BTreeMap`/`HashMap` callers alike.
    pub permission_settings: BTreeMap<String, PermissionFlag>,
}

/// Pure, deterministic argv builder (§4.2, C2). Never touches the
/// filesystem, environment, or clock; the same `(config, options)` pair
/// always yields byte-identical argv (property P7).
pub fn build(config: &AgentConfig, options: &BuildOptions) -> Vec<String> {
    let mut argv = vec![config.program.clone()];

    if options.passthrough {
        argv.extend(config.passthrough_base_args.iter().cloned());
    } else {
        argv.extend(config.base_args.iter().cloned());
    }

    if let (Some(flag), Some(model)) = (config.model_flag, &options.model) {
        argv.push(flag.to_string());
        argv.push(model.clone());
    }

    for (name, setting) in &options.permission_settings {
        let _ = name; // BTreeMap already iterates in lexicographic key order.
        match setting {
            PermissionFlag::Boolean { flag, enabled } => {
                if *enabled {
                    argv.push((*flag).to_string());
                }
            }
            PermissionFlag::Value { flag, value } => {
                if let Some(v) = value {
                    argv.push((*flag).to_string());
                    argv.push(v.clone());
                }
            }
        }
    }

    let can_resume = options.resume_acp_session_id.is_some() && config.supports_cli_resume;
    if can_resume {
        if let Some(flag) = config.resume_flag {
            argv.push(flag.to_string());
            argv.push(options.resume_acp_session_id.clone().unwrap());
        }
    } else if let Some(prompt) = &options.initial_prompt {
        argv.push(prompt.clone());
    }

    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> AgentConfig {
        AgentConfig {
            program: "myagent".into(),
            base_args: vec!["--protocol".into(), "acp".into()],
            passthrough_base_args: vec!["--interactive".into()],
            model_flag: Some("--model"),
            resume_flag: Some("--resume"),
            supports_cli_resume: true,
        }
    }

    #[test]
    fn builds_basic_non_passthrough_argv() {
        let config = sample_config();
        let options = BuildOptions {
            model: Some("gpt-5".into()),
            initial_prompt: Some("fix the bug".into()),
            ..Default::default()
        };
        let argv = build(&config, &options);
        assert_eq!(
            argv,
            vec!["myagent", "--protocol", "acp", "--model", "gpt-5", "fix the bug"]
        );
    }

    #[test]
    fn resume_flag_wins_over_initial_prompt_when_supported() {
        let config = sample_config();
        let options = BuildOptions {
            initial_prompt: Some("ignored".into()),
            resume_acp_session_id: Some("acp-42".into()),
            ..Default::default()
        };
        let argv = build(&config, &options);
        assert_eq!(argv, vec!["myagent", "--protocol", "acp", "--resume", "acp-42"]);
    }

    #[test]
    fn falls_back_to_initial_prompt_when_resume_unsupported() {
        let mut config = sample_config();
        config.supports_cli_resume = false;
        let options = BuildOptions {
            initial_prompt: Some("fix it".into()),
            resume_acp_session_id: Some("acp-1".into()),
            ..Default::default()
        };
        let argv = build(&config, &options);
        assert!(argv.contains(&"fix it".to_string()));
        assert!(!argv.contains(&"acp-1".to_string()));
    }

    #[test]
    fn permission_settings_are_sorted_lexicographically_regardless_of_insertion_order() {
        let config = sample_config();
        let mut permission_settings = BTreeMap::new();
        permission_settings.insert(
            "zeta".to_string(),
            PermissionFlag::Boolean {
                flag: "--zeta",
                enabled: true,
            },
        );
        permission_settings.insert(
            "alpha".to_string(),
            PermissionFlag::Value {
                flag: "--alpha",
                value: Some("1".into()),
            },
        );
        let options = BuildOptions {
            permission_settings,
            ..Default::default()
        };
        let argv = build(&config, &options);
        let alpha_pos = argv.iter().position(|s| s == "--alpha").unwrap();
        let zeta_pos = argv.iter().position(|s| s == "--zeta").unwrap();
        assert!(alpha_pos < zeta_pos);
    }

    #[test]
    fn passthrough_uses_passthrough_base_args() {
        let config = sample_config();
        let options = BuildOptions {
            passthrough: true,
            ..Default::default()
        };
        let argv = build(&config, &options);
        assert_eq!(argv, vec!["myagent", "--interactive"]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_permission_settings() -> impl Strategy<Value = BTreeMap<String, PermissionFlag>> {
        prop::collection::vec(("[a-z]{1,8}", any::<bool>()), 0..6).prop_map(|pairs| {
            pairs
                .into_iter()
                .map(|(name, enabled)| {
                    let flag: &'static str = Box::leak(format!("--{name}").into_boxed_str());
                    (name, PermissionFlag::Boolean { flag, enabled })
                })
                .collect()
        })
    }

    proptest! {
        /// P7: CommandBuilder is deterministic — building twice from the same
        /// inputs yields identical argv.
        #[test]
        fn build_is_deterministic(
            model in proptest::option::of("[a-z0-9-]{1,12}"),
            prompt in proptest::option::of(".{0,40}"),
            permission_settings in arb_permission_settings(),
        ) {
            let config = AgentConfig {
                program: "agent".into(),
                base_args: vec!["--protocol".into(), "acp".into()],
                passthrough_base_args: vec![],
                model_flag: Some("--model"),
                resume_flag: Some("--resume"),
                supports_cli_resume: true,
            };
            let options = BuildOptions {
                passthrough: false,
                model,
                initial_prompt: prompt,
                resume_acp_session_id: None,
                permission_settings,
            };
            let first = build(&config, &options);
            let second = build(&config, &options);
            prop_assert_eq!(first, second);
        }
    }
}
