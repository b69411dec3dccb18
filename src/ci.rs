//! Continuous-integration environment detection.
//!
//! A session is CI when any conventional CI flag is set to a true value. The
//! provider is identified from a built-in table of environment markers, and
//! the provider's environment also yields a stable user identifier.

use crate::utils::parse_bool_flag;

/// Environment flags that mark a CI session.
pub const CI_IDENTIFIER_ENV_KEYS: [&str; 7] = [
    "CI",
    "CONTINUOUS_INTEGRATION",
    "CI_BUILD_NUMBER",
    "CI_BUILD_ID",
    "CI_RUN_ID",
    "CI_APP_ID",
    "BUILD_NUMBER",
];

/// Environment variable identifying a CI provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderIdentifier {
    /// Variable name.
    pub key: &'static str,
    /// Required value. `None` matches any value.
    pub value: Option<&'static str>,
}

/// A known CI provider.
#[derive(Debug, PartialEq, Eq)]
pub struct CiProvider {
    pub name: &'static str,
    /// Any one matching identifier selects the provider.
    pub identifiers: &'static [ProviderIdentifier],
    /// Variables joined into the user identifier.
    pub user_keys: &'static [&'static str],
}

const fn present(key: &'static str) -> ProviderIdentifier {
    ProviderIdentifier { key, value: None }
}

const fn equals(key: &'static str, value: &'static str) -> ProviderIdentifier {
    ProviderIdentifier {
        key,
        value: Some(value),
    }
}

/// Built-in provider table, checked in order.
pub static PROVIDERS: &[CiProvider] = &[
    CiProvider {
        name: "GitHub Actions",
        identifiers: &[equals("GITHUB_ACTIONS", "true")],
        user_keys: &["GITHUB_REPOSITORY_OWNER"],
    },
    CiProvider {
        name: "GitLab CI",
        identifiers: &[present("GITLAB_CI")],
        user_keys: &["CI_PROJECT_NAMESPACE"],
    },
    CiProvider {
        name: "CircleCI",
        identifiers: &[equals("CIRCLECI", "true")],
        user_keys: &["CIRCLE_PROJECT_USERNAME"],
    },
    CiProvider {
        name: "Jenkins",
        identifiers: &[present("JENKINS_URL")],
        user_keys: &["JENKINS_URL"],
    },
    CiProvider {
        name: "Travis CI",
        identifiers: &[present("TRAVIS_REPO_SLUG")],
        user_keys: &["TRAVIS_REPO_SLUG"],
    },
    CiProvider {
        name: "Azure Pipelines",
        identifiers: &[equals("TF_BUILD", "True")],
        user_keys: &["SYSTEM_TEAMFOUNDATIONCOLLECTIONURI"],
    },
    CiProvider {
        name: "Bitbucket Pipelines",
        identifiers: &[present("BITBUCKET_BUILD_NUMBER")],
        user_keys: &["BITBUCKET_WORKSPACE"],
    },
    CiProvider {
        name: "Buildkite",
        identifiers: &[equals("BUILDKITE", "true")],
        user_keys: &["BUILDKITE_ORGANIZATION_SLUG"],
    },
];

impl CiProvider {
    fn matches(&self, lookup: &impl Fn(&str) -> Option<String>) -> bool {
        self.identifiers.iter().any(|identifier| {
            lookup(identifier.key).is_some_and(|value| match identifier.value {
                Some(expected) => value == expected,
                None => true,
            })
        })
    }

    /// Joins the non-empty user key values with `/`.
    ///
    /// For keys containing `SLUG`, only the part before the first `/` is used.
    pub fn user_identifier(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        let values: Vec<String> = self
            .user_keys
            .iter()
            .filter_map(|key| {
                let value = lookup(key).filter(|v| !v.is_empty())?;
                if key.contains("SLUG") {
                    value.split('/').next().map(String::from)
                } else {
                    Some(value)
                }
            })
            .collect();

        if values.is_empty() {
            None
        } else {
            Some(values.join("/"))
        }
    }
}

/// CI facts for the current process.
#[derive(Debug, Clone, Default)]
pub struct CiSession {
    pub is_ci: bool,
    pub provider: Option<&'static CiProvider>,
    pub user_identifier: Option<String>,
}

impl CiSession {
    /// Detects the CI session from the process environment.
    pub fn detect(custom_identifier_key: &str) -> Self {
        let session = Self::detect_with(|key| std::env::var(key).ok(), custom_identifier_key);

        if session.is_ci {
            println!("> Detected CI environment");
            if let Some(provider) = session.provider {
                println!("> Identified CI provider: {}", provider.name);
            }
        }

        session
    }

    /// Detects the CI session using `lookup` to read environment variables.
    ///
    /// The variable named by `custom_identifier_key` overrides the provider's
    /// user identifier when set.
    pub fn detect_with(
        lookup: impl Fn(&str) -> Option<String>,
        custom_identifier_key: &str,
    ) -> Self {
        let is_ci = CI_IDENTIFIER_ENV_KEYS.iter().any(|key| {
            lookup(key)
                .and_then(|value| parse_bool_flag(&value))
                .unwrap_or(false)
        });
        if !is_ci {
            return Self::default();
        }

        let provider = PROVIDERS.iter().find(|provider| provider.matches(&lookup));
        let user_identifier = lookup(custom_identifier_key)
            .filter(|v| !v.is_empty())
            .or_else(|| provider.and_then(|p| p.user_identifier(&lookup)));

        Self {
            is_ci,
            provider,
            user_identifier,
        }
    }

    /// Provider name, if one was identified.
    pub fn provider_name(&self) -> Option<&'static str> {
        self.provider.map(|p| p.name)
    }
}
