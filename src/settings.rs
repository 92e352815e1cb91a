//! Declarative settings schema and its compilation into a runtime
//! [`Config`].
//!
//! The settings types mirror the configuration file format: top-level
//! `Ingress` and `Egress` sections, each carrying `Rules`, `WhiteList`,
//! and `UniqueName`. Files load from YAML or JSON. Identity extractors are
//! code, not data, so they are supplied at compile time and attached to
//! every rule of the section.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FloodgateError, Result};
use crate::limit::RateLimitMethod;
use crate::rules::{Config, IdentityExtractor, Rule};

/// Default semaphore timeout when `TimeoutInSeconds` is omitted.
const DEFAULT_SEMAPHORE_TIMEOUT_SECS: u64 = 100;

/// Root of a floodgate settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FloodgateSettings {
    pub ingress: SectionSettings,
    pub egress: EgressSettings,
}

/// Rules, whitelist, and counter prefix for one direction of traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SectionSettings {
    pub rules: Vec<RuleSettings>,
    pub white_list: Vec<RuleSettings>,
    pub unique_name: String,
}

/// The egress section adds the propagation switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EgressSettings {
    pub rules: Vec<RuleSettings>,
    pub white_list: Vec<RuleSettings>,
    pub unique_name: String,
    pub propagate_to_ingress: bool,
}

/// One declarative rule: the match predicate plus the rate limit.
///
/// Whitelist entries reuse the same shape; their `RateLimit` is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RuleSettings {
    pub uri_pattern: Option<String>,
    /// Comma-separated method list, e.g. `"GET,POST"`.
    pub method: Option<String>,
    pub header_name: Option<String>,
    pub header_value: Option<String>,
    pub identity_id: Option<String>,
    pub rate_limit: Option<RateLimitSettings>,
    pub max_delay_in_seconds: u64,
}

/// Algorithm selection and its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RateLimitSettings {
    pub algorithm: Algorithm,
    pub permit_limit: u64,
    #[serde(default)]
    pub interval_in_seconds: u64,
    #[serde(default = "default_num_buckets")]
    pub num_of_buckets: u64,
    #[serde(default = "default_timeout")]
    pub timeout_in_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    Semaphore,
}

fn default_num_buckets() -> u64 {
    1
}

fn default_timeout() -> u64 {
    DEFAULT_SEMAPHORE_TIMEOUT_SECS
}

impl FloodgateSettings {
    /// Load settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse settings: {e}")))
    }

    /// Load settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse settings: {e}")))
    }

    /// Load settings from a file; `.json` parses as JSON, anything else as
    /// YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading floodgate settings");

        let contents = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&contents)
        } else {
            Self::from_yaml(&contents)
        }
    }
}

impl SectionSettings {
    /// Compile into the runtime rule set.
    ///
    /// `extractor`, when given, is attached to every rule and whitelist
    /// entry of the section. Compilation fails if a rule names an
    /// `IdentityId` without an extractor to produce one.
    pub fn compile(&self, extractor: Option<IdentityExtractor>) -> Result<Config> {
        compile_section(&self.rules, &self.white_list, &self.unique_name, extractor)
    }
}

impl EgressSettings {
    /// Compile into the runtime rule set; see [`SectionSettings::compile`].
    pub fn compile(&self, extractor: Option<IdentityExtractor>) -> Result<Config> {
        compile_section(&self.rules, &self.white_list, &self.unique_name, extractor)
    }
}

fn compile_section(
    rules: &[RuleSettings],
    white_list: &[RuleSettings],
    unique_name: &str,
    extractor: Option<IdentityExtractor>,
) -> Result<Config> {
    let rules = rules
        .iter()
        .map(|r| compile_rule(r, extractor.clone(), false))
        .collect::<Result<Vec<_>>>()?;
    let whitelist = white_list
        .iter()
        .map(|r| compile_rule(r, extractor.clone(), true))
        .collect::<Result<Vec<_>>>()?;

    Ok(Config {
        rules,
        whitelist,
        unique_name: unique_name.to_string(),
    })
}

fn compile_rule(
    settings: &RuleSettings,
    extractor: Option<IdentityExtractor>,
    predicate_only: bool,
) -> Result<Rule> {
    let method = if predicate_only {
        // Whitelist entries carry no enforcement; the placeholder is never
        // evaluated.
        RateLimitMethod::FixedWindow {
            permit_limit: 1,
            interval_secs: 1,
        }
    } else {
        let rate_limit = settings
            .rate_limit
            .as_ref()
            .ok_or_else(|| FloodgateError::Config("Rule is missing RateLimit".to_string()))?;
        compile_method(rate_limit)?
    };

    let mut rule = Rule::new(method).with_max_delay_secs(settings.max_delay_in_seconds);

    if let Some(ref pattern) = settings.uri_pattern {
        if !pattern.is_empty() {
            let regex = regex::Regex::new(pattern).map_err(|e| {
                FloodgateError::Config(format!("Invalid UriPattern '{pattern}': {e}"))
            })?;
            rule = rule.with_uri_pattern(regex);
        }
    }

    if let Some(ref methods) = settings.method {
        rule = rule.with_methods(methods.split(','));
    }

    if let Some(ref name) = settings.header_name {
        rule = rule.with_header(name.clone(), settings.header_value.clone());
    }

    if let Some(extractor) = extractor {
        rule = rule.with_identity_extractor(extractor);
    }

    if let Some(ref identity_id) = settings.identity_id {
        if rule.identity_extractor.is_none() {
            return Err(FloodgateError::Config(format!(
                "Rule sets IdentityId '{identity_id}' but no identity extractor was supplied"
            )));
        }
        rule = rule.with_identity_id(identity_id.clone());
    }

    Ok(rule)
}

fn compile_method(settings: &RateLimitSettings) -> Result<RateLimitMethod> {
    if settings.permit_limit == 0 {
        return Err(FloodgateError::Config(
            "PermitLimit must be greater than zero".to_string(),
        ));
    }

    match settings.algorithm {
        Algorithm::FixedWindow => {
            if settings.interval_in_seconds == 0 {
                return Err(FloodgateError::Config(
                    "FixedWindow requires IntervalInSeconds > 0".to_string(),
                ));
            }
            Ok(RateLimitMethod::FixedWindow {
                permit_limit: settings.permit_limit,
                interval_secs: settings.interval_in_seconds,
            })
        }
        Algorithm::SlidingWindow => {
            if settings.interval_in_seconds == 0 {
                return Err(FloodgateError::Config(
                    "SlidingWindow requires IntervalInSeconds > 0".to_string(),
                ));
            }
            if settings.num_of_buckets == 0 || settings.num_of_buckets > settings.interval_in_seconds
            {
                return Err(FloodgateError::Config(format!(
                    "NumOfBuckets must be between 1 and IntervalInSeconds ({})",
                    settings.interval_in_seconds
                )));
            }
            Ok(RateLimitMethod::SlidingWindow {
                permit_limit: settings.permit_limit,
                interval_secs: settings.interval_in_seconds,
                num_buckets: settings.num_of_buckets,
            })
        }
        Algorithm::Semaphore => {
            if settings.timeout_in_seconds == 0 {
                return Err(FloodgateError::Config(
                    "Semaphore requires TimeoutInSeconds > 0".to_string(),
                ));
            }
            Ok(RateLimitMethod::Semaphore {
                permit_limit: settings.permit_limit,
                timeout_secs: settings.timeout_in_seconds,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::rules::RequestAttributes;

    #[test]
    fn parse_yaml_settings() {
        let yaml = r#"
Ingress:
  UniqueName: my-service
  Rules:
    - UriPattern: "/api/"
      Method: "GET,POST"
      RateLimit:
        Algorithm: FixedWindow
        PermitLimit: 10
        IntervalInSeconds: 60
      MaxDelayInSeconds: 5
  WhiteList:
    - UriPattern: "/health"
Egress:
  PropagateToIngress: true
  Rules:
    - RateLimit:
        Algorithm: Semaphore
        PermitLimit: 4
"#;
        let settings = FloodgateSettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.ingress.unique_name, "my-service");
        assert_eq!(settings.ingress.rules.len(), 1);
        assert_eq!(settings.ingress.white_list.len(), 1);
        assert!(settings.egress.propagate_to_ingress);

        let rate_limit = settings.egress.rules[0].rate_limit.as_ref().unwrap();
        assert_eq!(rate_limit.algorithm, Algorithm::Semaphore);
        // Omitted timeout falls back to the default.
        assert_eq!(rate_limit.timeout_in_seconds, 100);
    }

    #[test]
    fn parse_json_settings() {
        let json = r#"{
            "Ingress": {
                "Rules": [
                    {
                        "UriPattern": "/items",
                        "RateLimit": {
                            "Algorithm": "SlidingWindow",
                            "PermitLimit": 6,
                            "IntervalInSeconds": 12,
                            "NumOfBuckets": 3
                        }
                    }
                ]
            }
        }"#;
        let settings = FloodgateSettings::from_json(json).unwrap();
        let config = settings.ingress.compile(None).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(
            config.rules[0].method,
            RateLimitMethod::SlidingWindow {
                permit_limit: 6,
                interval_secs: 12,
                num_buckets: 3
            }
        );
    }

    #[test]
    fn method_list_splits_on_commas() {
        let rule = RuleSettings {
            method: Some("get, Post".to_string()),
            rate_limit: Some(RateLimitSettings {
                algorithm: Algorithm::FixedWindow,
                permit_limit: 1,
                interval_in_seconds: 10,
                num_of_buckets: 1,
                timeout_in_seconds: 100,
            }),
            ..Default::default()
        };
        let compiled = compile_rule(&rule, None, false).unwrap();
        assert_eq!(compiled.methods, vec!["GET", "POST"]);
    }

    #[test]
    fn zero_permit_limit_is_rejected() {
        let settings = RateLimitSettings {
            algorithm: Algorithm::FixedWindow,
            permit_limit: 0,
            interval_in_seconds: 10,
            num_of_buckets: 1,
            timeout_in_seconds: 100,
        };
        assert!(compile_method(&settings).is_err());
    }

    #[test]
    fn sliding_window_bucket_count_is_bounded_by_interval() {
        let settings = RateLimitSettings {
            algorithm: Algorithm::SlidingWindow,
            permit_limit: 5,
            interval_in_seconds: 10,
            num_of_buckets: 11,
            timeout_in_seconds: 100,
        };
        assert!(compile_method(&settings).is_err());
    }

    #[test]
    fn identity_id_without_extractor_fails_compilation() {
        let rule = RuleSettings {
            identity_id: Some("tenant-a".to_string()),
            rate_limit: Some(RateLimitSettings {
                algorithm: Algorithm::FixedWindow,
                permit_limit: 1,
                interval_in_seconds: 10,
                num_of_buckets: 1,
                timeout_in_seconds: 100,
            }),
            ..Default::default()
        };
        assert!(compile_rule(&rule, None, false).is_err());

        let extractor: IdentityExtractor = Arc::new(|_: &RequestAttributes| String::new());
        assert!(compile_rule(&rule, Some(extractor), false).is_ok());
    }

    #[test]
    fn invalid_uri_pattern_is_rejected() {
        let rule = RuleSettings {
            uri_pattern: Some("(".to_string()),
            rate_limit: Some(RateLimitSettings {
                algorithm: Algorithm::FixedWindow,
                permit_limit: 1,
                interval_in_seconds: 10,
                num_of_buckets: 1,
                timeout_in_seconds: 100,
            }),
            ..Default::default()
        };
        assert!(compile_rule(&rule, None, false).is_err());
    }

    #[test]
    fn whitelist_entries_need_no_rate_limit() {
        let yaml = r#"
Ingress:
  Rules:
    - RateLimit:
        Algorithm: FixedWindow
        PermitLimit: 1
        IntervalInSeconds: 10
  WhiteList:
    - UriPattern: "/health"
      Method: GET
"#;
        let settings = FloodgateSettings::from_yaml(yaml).unwrap();
        let config = settings.ingress.compile(None).unwrap();
        assert_eq!(config.whitelist.len(), 1);
        assert!(config.is_whitelisted(&RequestAttributes::new("/health", "GET")));
        assert!(!config.is_whitelisted(&RequestAttributes::new("/health", "POST")));
    }
}
