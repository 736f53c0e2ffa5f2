//! Annotation key layout and freshness policy.
//!
//! A [`Config`] is resolved once, when a [`TracingClient`] is built, from the
//! compile-time defaults, then environment variables, then explicit `with_*`
//! overrides. Every override that is empty or invalid is ignored and the prior
//! value is kept.
//!
//! [`TracingClient`]: crate::client::TracingClient
use opentelemetry::otel_warn;
use opentelemetry::trace::TraceState;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Annotation key prefix.
pub(crate) const OTEL_OPERATORTRACE_ANNOTATION_PREFIX: &str = "OTEL_OPERATORTRACE_ANNOTATION_PREFIX";
/// Default annotation key prefix.
pub(crate) const OTEL_OPERATORTRACE_ANNOTATION_PREFIX_DEFAULT: &str =
    "operatortrace.azure.microsoft.com";
/// How long a persisted context stays usable, in milliseconds.
pub(crate) const OTEL_OPERATORTRACE_TRACE_EXPIRATION: &str = "OTEL_OPERATORTRACE_TRACE_EXPIRATION";
/// Default expiration, 20 minutes.
pub(crate) const OTEL_OPERATORTRACE_TRACE_EXPIRATION_DEFAULT: u64 = 20 * 60 * 1000;
/// Key reserved inside `tracestate` for the freshness timestamp.
pub(crate) const OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY: &str =
    "OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY";
/// Default timestamp key.
pub(crate) const OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY_DEFAULT: &str = "operatortrace_ts";
/// Annotation a peer system writes its `traceparent` under.
pub(crate) const OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION: &str =
    "OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION";
/// Annotation a peer system writes its `tracestate` under.
pub(crate) const OTEL_OPERATORTRACE_INCOMING_TRACESTATE_ANNOTATION: &str =
    "OTEL_OPERATORTRACE_INCOMING_TRACESTATE_ANNOTATION";
/// Relationship given to a context read from the incoming annotation.
pub(crate) const OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP: &str =
    "OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP";

/// Default suffix of the emitted `traceparent` annotation.
pub(crate) const TRACEPARENT_SUFFIX_DEFAULT: &str = "traceparent";
/// Default suffix of the emitted `tracestate` annotation.
pub(crate) const TRACESTATE_SUFFIX_DEFAULT: &str = "tracestate";

const LEGACY_TRACE_ID_SUFFIX: &str = "trace-id";
const LEGACY_SPAN_ID_SUFFIX: &str = "span-id";
const LEGACY_TRACE_TIME_SUFFIX: &str = "trace-id-time";

/// How a recovered context is attached to the span that starts from it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Relationship {
    /// The new span becomes a child of the recovered context.
    Parent,
    /// The new span only links to the recovered context.
    #[default]
    Link,
}

impl Relationship {
    /// Lowercase name, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::Parent => "parent",
            Relationship::Link => "link",
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names neither `parent` nor `link`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseRelationshipError(String);

impl fmt::Display for ParseRelationshipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown relationship {:?}, expected \"parent\" or \"link\"", self.0)
    }
}

impl std::error::Error for ParseRelationshipError {}

impl FromStr for Relationship {
    type Err = ParseRelationshipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parent" => Ok(Relationship::Parent),
            "link" => Ok(Relationship::Link),
            _ => Err(ParseRelationshipError(s.to_string())),
        }
    }
}

/// One annotation key pair that may hold a persisted context, and how that
/// context attaches when it is found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CarrierCandidate {
    /// Annotation holding the `traceparent` value.
    pub parent_key: String,
    /// Annotation holding the `tracestate` value.
    pub state_key: String,
    /// Relationship given to a match.
    pub relationship: Relationship,
}

/// Resolved, immutable configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    annotation_prefix: String,
    trace_expiration: Duration,
    tracestate_timestamp_key: String,
    traceparent_suffix: String,
    tracestate_suffix: String,
    incoming_traceparent_annotation: Option<String>,
    incoming_tracestate_annotation: Option<String>,
    incoming_relationship: Relationship,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().build()
    }
}

impl Config {
    /// Prefix of every annotation key this crate writes, without a trailing `/`.
    pub fn annotation_prefix(&self) -> &str {
        &self.annotation_prefix
    }

    /// Persisted contexts older than this are treated as absent.
    pub fn trace_expiration(&self) -> Duration {
        self.trace_expiration
    }

    /// Key reserved inside `tracestate` for the freshness timestamp.
    pub fn tracestate_timestamp_key(&self) -> &str {
        &self.tracestate_timestamp_key
    }

    /// Annotation a peer system writes its `traceparent` under, if configured.
    pub fn incoming_traceparent_annotation(&self) -> Option<&str> {
        self.incoming_traceparent_annotation.as_deref()
    }

    /// Annotation a peer system writes its `tracestate` under, if configured.
    pub fn incoming_tracestate_annotation(&self) -> Option<&str> {
        self.incoming_tracestate_annotation.as_deref()
    }

    /// Relationship given to a context read from the incoming annotation.
    pub fn incoming_relationship(&self) -> Relationship {
        self.incoming_relationship
    }

    /// `<prefix>/<traceparent suffix>`
    pub fn emitted_traceparent_key(&self) -> String {
        self.prefixed(&self.traceparent_suffix)
    }

    /// `<prefix>/<tracestate suffix>`
    pub fn emitted_tracestate_key(&self) -> String {
        self.prefixed(&self.tracestate_suffix)
    }

    /// `<prefix>/trace-id`
    pub fn legacy_trace_id_key(&self) -> String {
        self.prefixed(LEGACY_TRACE_ID_SUFFIX)
    }

    /// `<prefix>/span-id`
    pub fn legacy_span_id_key(&self) -> String {
        self.prefixed(LEGACY_SPAN_ID_SUFFIX)
    }

    /// `<prefix>/trace-id-time`
    pub fn legacy_trace_time_key(&self) -> String {
        self.prefixed(LEGACY_TRACE_TIME_SUFFIX)
    }

    /// The `traceparent` key written with every setting at its default.
    pub fn default_traceparent_key(&self) -> String {
        format!("{OTEL_OPERATORTRACE_ANNOTATION_PREFIX_DEFAULT}/{TRACEPARENT_SUFFIX_DEFAULT}")
    }

    /// The `tracestate` key written with every setting at its default.
    pub fn default_tracestate_key(&self) -> String {
        format!("{OTEL_OPERATORTRACE_ANNOTATION_PREFIX_DEFAULT}/{TRACESTATE_SUFFIX_DEFAULT}")
    }

    /// Carrier key pairs in the order they are tried.
    ///
    /// 1. the incoming annotation, with [`incoming_relationship`](Self::incoming_relationship),
    /// 2. the emitted annotation, as a parent,
    /// 3. the default annotation when it differs from the emitted one, as a parent.
    ///
    /// The legacy flat keys are not a candidate pair; they are consulted only
    /// after every candidate fails.
    pub fn carrier_candidates(&self) -> Vec<CarrierCandidate> {
        let mut candidates = Vec::with_capacity(3);
        if let Some(parent_key) = self.incoming_traceparent_annotation() {
            candidates.push(CarrierCandidate {
                parent_key: parent_key.to_string(),
                state_key: self
                    .incoming_tracestate_annotation()
                    .unwrap_or_default()
                    .to_string(),
                relationship: self.incoming_relationship,
            });
        }
        candidates.extend(self.own_carrier_candidates());
        candidates
    }

    /// The emitted and default pairs of [`carrier_candidates`](Self::carrier_candidates),
    /// without the incoming annotation, even when it names the same key.
    pub fn own_carrier_candidates(&self) -> Vec<CarrierCandidate> {
        let emitted = CarrierCandidate {
            parent_key: self.emitted_traceparent_key(),
            state_key: self.emitted_tracestate_key(),
            relationship: Relationship::Parent,
        };
        let default_parent_key = self.default_traceparent_key();
        let default_state_key = self.default_tracestate_key();
        let default_differs =
            default_parent_key != emitted.parent_key || default_state_key != emitted.state_key;

        let mut candidates = Vec::with_capacity(2);
        candidates.push(emitted);
        if default_differs {
            candidates.push(CarrierCandidate {
                parent_key: default_parent_key,
                state_key: default_state_key,
                relationship: Relationship::Parent,
            });
        }
        candidates
    }

    /// Every annotation key this crate reads or writes.
    pub fn trace_annotation_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(9);
        for candidate in self.carrier_candidates() {
            keys.push(candidate.parent_key);
            if !candidate.state_key.is_empty() {
                keys.push(candidate.state_key);
            }
        }
        keys.push(self.legacy_trace_id_key());
        keys.push(self.legacy_span_id_key());
        keys.push(self.legacy_trace_time_key());
        keys
    }

    fn prefixed(&self, suffix: &str) -> String {
        format!("{}/{}", self.annotation_prefix, suffix)
    }
}

/// A builder for creating [`Config`] instances.
#[derive(Debug)]
pub struct ConfigBuilder {
    annotation_prefix: String,
    trace_expiration: Duration,
    tracestate_timestamp_key: String,
    traceparent_suffix: String,
    tracestate_suffix: String,
    incoming_traceparent_annotation: Option<String>,
    incoming_tracestate_annotation: Option<String>,
    incoming_relationship: Relationship,
}

impl Default for ConfigBuilder {
    /// Create a new [`ConfigBuilder`] initialized with the default values.
    /// The values are overriden by environment variables if set.
    /// The supported environment variables are:
    /// * `OTEL_OPERATORTRACE_ANNOTATION_PREFIX`
    /// * `OTEL_OPERATORTRACE_TRACE_EXPIRATION`
    /// * `OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY`
    /// * `OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION`
    /// * `OTEL_OPERATORTRACE_INCOMING_TRACESTATE_ANNOTATION`
    /// * `OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP`
    fn default() -> Self {
        ConfigBuilder::defaults().init_from_env_vars()
    }
}

impl ConfigBuilder {
    /// The compile-time defaults, without reading the environment.
    pub(crate) fn defaults() -> Self {
        ConfigBuilder {
            annotation_prefix: OTEL_OPERATORTRACE_ANNOTATION_PREFIX_DEFAULT.to_string(),
            trace_expiration: Duration::from_millis(OTEL_OPERATORTRACE_TRACE_EXPIRATION_DEFAULT),
            tracestate_timestamp_key: OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY_DEFAULT
                .to_string(),
            traceparent_suffix: TRACEPARENT_SUFFIX_DEFAULT.to_string(),
            tracestate_suffix: TRACESTATE_SUFFIX_DEFAULT.to_string(),
            incoming_traceparent_annotation: None,
            incoming_tracestate_annotation: None,
            incoming_relationship: Relationship::Link,
        }
    }

    /// Set the annotation key prefix. A trailing `/` is trimmed.
    /// The default value is `operatortrace.azure.microsoft.com`.
    pub fn with_annotation_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        match sanitize_prefix(prefix.as_ref()) {
            Some(prefix) => self.annotation_prefix = prefix,
            None => {
                otel_warn!(
                    name: "OperatorTrace.Config.InvalidAnnotationPrefix",
                    message = "Annotation prefix is empty, keeping the previous prefix",
                    annotation_prefix = self.annotation_prefix.as_str(),
                );
            }
        }
        self
    }

    /// Set how long a persisted context stays usable. Zero is ignored.
    /// The default value is 20 minutes.
    pub fn with_trace_expiration(mut self, expiration: Duration) -> Self {
        if expiration.is_zero() {
            otel_warn!(
                name: "OperatorTrace.Config.InvalidTraceExpiration",
                message = "Trace expiration must be greater than zero, keeping the previous value",
            );
        } else {
            self.trace_expiration = expiration;
        }
        self
    }

    /// Set the key reserved inside `tracestate` for the freshness timestamp.
    /// Keys that are not valid `tracestate` keys are ignored.
    /// The default value is `operatortrace_ts`.
    pub fn with_tracestate_timestamp_key(mut self, key: impl AsRef<str>) -> Self {
        let key = key.as_ref().trim();
        if is_valid_tracestate_key(key) {
            self.tracestate_timestamp_key = key.to_string();
        } else {
            otel_warn!(
                name: "OperatorTrace.Config.InvalidTimestampKey",
                message = "Tracestate timestamp key is not a valid tracestate key, keeping the previous key",
                tracestate_timestamp_key = format!("{:?}", key),
            );
        }
        self
    }

    /// Read an incoming `traceparent` from this annotation before any other.
    pub fn with_incoming_traceparent_annotation(mut self, key: impl AsRef<str>) -> Self {
        match non_empty(key.as_ref()) {
            Some(key) => self.incoming_traceparent_annotation = Some(key),
            None => {
                otel_warn!(
                    name: "OperatorTrace.Config.InvalidIncomingAnnotation",
                    message = "Incoming traceparent annotation is empty, keeping the previous key",
                );
            }
        }
        self
    }

    /// Read the incoming `tracestate` paired with
    /// [`with_incoming_traceparent_annotation`](Self::with_incoming_traceparent_annotation).
    pub fn with_incoming_tracestate_annotation(mut self, key: impl AsRef<str>) -> Self {
        match non_empty(key.as_ref()) {
            Some(key) => self.incoming_tracestate_annotation = Some(key),
            None => {
                otel_warn!(
                    name: "OperatorTrace.Config.InvalidIncomingAnnotation",
                    message = "Incoming tracestate annotation is empty, keeping the previous key",
                );
            }
        }
        self
    }

    /// Set how a context read from the incoming annotation attaches to the
    /// new span. The default value is [`Relationship::Link`].
    pub fn with_incoming_relationship(mut self, relationship: Relationship) -> Self {
        self.incoming_relationship = relationship;
        self
    }

    /// Set the suffixes of the emitted annotations. Each suffix is trimmed and
    /// a leading `/` removed; an empty suffix leaves that key unchanged.
    pub fn with_emitted_suffixes(
        mut self,
        traceparent_suffix: impl AsRef<str>,
        tracestate_suffix: impl AsRef<str>,
    ) -> Self {
        if let Some(suffix) = sanitize_suffix(traceparent_suffix.as_ref()) {
            self.traceparent_suffix = suffix;
        }
        if let Some(suffix) = sanitize_suffix(tracestate_suffix.as_ref()) {
            self.tracestate_suffix = suffix;
        }
        self
    }

    /// Builds the immutable [`Config`].
    pub fn build(self) -> Config {
        Config {
            annotation_prefix: self.annotation_prefix,
            trace_expiration: self.trace_expiration,
            tracestate_timestamp_key: self.tracestate_timestamp_key,
            traceparent_suffix: self.traceparent_suffix,
            tracestate_suffix: self.tracestate_suffix,
            incoming_traceparent_annotation: self.incoming_traceparent_annotation,
            incoming_tracestate_annotation: self.incoming_tracestate_annotation,
            incoming_relationship: self.incoming_relationship,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Ok(prefix) = env::var(OTEL_OPERATORTRACE_ANNOTATION_PREFIX) {
            self = self.with_annotation_prefix(prefix);
        }

        if let Ok(expiration) = env::var(OTEL_OPERATORTRACE_TRACE_EXPIRATION) {
            match u64::from_str(expiration.trim()) {
                Ok(millis) => self = self.with_trace_expiration(Duration::from_millis(millis)),
                Err(_) => {
                    otel_warn!(
                        name: "OperatorTrace.Config.InvalidTraceExpiration",
                        message = "OTEL_OPERATORTRACE_TRACE_EXPIRATION must be a number of milliseconds, keeping the previous value",
                        otel_operatortrace_trace_expiration = format!("{:?}", expiration),
                    );
                }
            }
        }

        if let Ok(key) = env::var(OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY) {
            self = self.with_tracestate_timestamp_key(key);
        }

        if let Ok(key) = env::var(OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION) {
            self = self.with_incoming_traceparent_annotation(key);
        }

        if let Ok(key) = env::var(OTEL_OPERATORTRACE_INCOMING_TRACESTATE_ANNOTATION) {
            self = self.with_incoming_tracestate_annotation(key);
        }

        if let Ok(relationship) = env::var(OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP) {
            match Relationship::from_str(&relationship) {
                Ok(relationship) => self.incoming_relationship = relationship,
                Err(err) => {
                    otel_warn!(
                        name: "OperatorTrace.Config.InvalidIncomingRelationship",
                        message = "OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP is invalid, keeping the previous relationship",
                        error = format!("{err}"),
                    );
                }
            }
        }

        self
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn sanitize_prefix(prefix: &str) -> Option<String> {
    non_empty(prefix.trim().trim_end_matches('/'))
}

fn sanitize_suffix(suffix: &str) -> Option<String> {
    non_empty(suffix.trim().trim_start_matches('/'))
}

fn is_valid_tracestate_key(key: &str) -> bool {
    !key.is_empty() && TraceState::default().insert(key, "0").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ENV_VARS: [&str; 6] = [
        OTEL_OPERATORTRACE_ANNOTATION_PREFIX,
        OTEL_OPERATORTRACE_TRACE_EXPIRATION,
        OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY,
        OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION,
        OTEL_OPERATORTRACE_INCOMING_TRACESTATE_ANNOTATION,
        OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP,
    ];

    fn builder() -> ConfigBuilder {
        ConfigBuilder::defaults()
    }

    #[test]
    fn test_default_config() {
        let config = temp_env::with_vars_unset(ENV_VARS, Config::default);

        assert_eq!(
            config.annotation_prefix(),
            OTEL_OPERATORTRACE_ANNOTATION_PREFIX_DEFAULT
        );
        assert_eq!(config.trace_expiration(), Duration::from_secs(20 * 60));
        assert_eq!(config.tracestate_timestamp_key(), "operatortrace_ts");
        assert_eq!(config.incoming_relationship(), Relationship::Link);
        assert_eq!(config.incoming_traceparent_annotation(), None);
        assert_eq!(
            config.emitted_traceparent_key(),
            "operatortrace.azure.microsoft.com/traceparent"
        );
        assert_eq!(
            config.emitted_tracestate_key(),
            "operatortrace.azure.microsoft.com/tracestate"
        );
        assert_eq!(
            config.legacy_trace_time_key(),
            "operatortrace.azure.microsoft.com/trace-id-time"
        );
    }

    #[test]
    fn test_config_configurable_by_env_vars() {
        let env_vars = vec![
            (OTEL_OPERATORTRACE_ANNOTATION_PREFIX, Some("example.com/")),
            (OTEL_OPERATORTRACE_TRACE_EXPIRATION, Some("60000")),
            (OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY, Some("ts")),
            (
                OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION,
                Some("peer.io/traceparent"),
            ),
            (
                OTEL_OPERATORTRACE_INCOMING_TRACESTATE_ANNOTATION,
                Some("peer.io/tracestate"),
            ),
            (OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP, Some("Parent")),
        ];

        let config = temp_env::with_vars(env_vars, Config::default);

        assert_eq!(config.annotation_prefix(), "example.com");
        assert_eq!(config.trace_expiration(), Duration::from_millis(60000));
        assert_eq!(config.tracestate_timestamp_key(), "ts");
        assert_eq!(
            config.incoming_traceparent_annotation(),
            Some("peer.io/traceparent")
        );
        assert_eq!(
            config.incoming_tracestate_annotation(),
            Some("peer.io/tracestate")
        );
        assert_eq!(config.incoming_relationship(), Relationship::Parent);
        assert_eq!(config.emitted_traceparent_key(), "example.com/traceparent");
    }

    #[test]
    fn test_invalid_env_vars_keep_defaults() {
        let env_vars = vec![
            (OTEL_OPERATORTRACE_ANNOTATION_PREFIX, Some("/")),
            (OTEL_OPERATORTRACE_TRACE_EXPIRATION, Some("soon")),
            (OTEL_OPERATORTRACE_TRACESTATE_TIMESTAMP_KEY, Some("Not A Key")),
            (OTEL_OPERATORTRACE_INCOMING_TRACEPARENT_ANNOTATION, Some("  ")),
            (OTEL_OPERATORTRACE_INCOMING_RELATIONSHIP, Some("sibling")),
        ];

        let config = temp_env::with_vars(env_vars, Config::default);
        let defaults = temp_env::with_vars_unset(ENV_VARS, Config::default);

        assert_eq!(config, defaults);
    }

    #[test]
    fn test_zero_expiration_is_ignored() {
        let config = builder()
            .with_trace_expiration(Duration::from_secs(30))
            .with_trace_expiration(Duration::ZERO)
            .build();
        assert_eq!(config.trace_expiration(), Duration::from_secs(30));
    }

    #[test]
    fn test_explicit_overrides_win_over_env() {
        let config = temp_env::with_vars(
            [(OTEL_OPERATORTRACE_ANNOTATION_PREFIX, Some("from-env.io"))],
            || {
                ConfigBuilder::default()
                    .with_annotation_prefix("explicit.io")
                    .build()
            },
        );
        assert_eq!(config.annotation_prefix(), "explicit.io");
    }

    #[rstest]
    #[case("custom/", "state", "custom", "state")]
    #[case("  /custom ", " /state", "custom", "state")]
    #[case("", "state", "traceparent", "state")]
    #[case("custom", "", "custom", "tracestate")]
    #[case("/", " ", "traceparent", "tracestate")]
    fn test_emitted_suffixes(
        #[case] parent: &str,
        #[case] state: &str,
        #[case] expected_parent: &str,
        #[case] expected_state: &str,
    ) {
        let config = builder()
            .with_annotation_prefix("example.com")
            .with_emitted_suffixes(parent, state)
            .build();
        assert_eq!(
            config.emitted_traceparent_key(),
            format!("example.com/{expected_parent}")
        );
        assert_eq!(
            config.emitted_tracestate_key(),
            format!("example.com/{expected_state}")
        );
    }

    #[rstest]
    #[case("parent", Some(Relationship::Parent))]
    #[case("LINK", Some(Relationship::Link))]
    #[case(" Link ", Some(Relationship::Link))]
    #[case("child", None)]
    #[case("", None)]
    fn test_parse_relationship(#[case] input: &str, #[case] expected: Option<Relationship>) {
        assert_eq!(input.parse::<Relationship>().ok(), expected);
    }

    #[test]
    fn test_candidates_with_defaults() {
        let config = builder().build();
        let candidates = config.carrier_candidates();

        // emitted and default keys coincide, so only one pair is tried
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].parent_key, config.default_traceparent_key());
        assert_eq!(candidates[0].relationship, Relationship::Parent);
    }

    #[test]
    fn test_candidate_order() {
        let config = builder()
            .with_annotation_prefix("example.com")
            .with_incoming_traceparent_annotation("peer.io/traceparent")
            .with_incoming_tracestate_annotation("peer.io/tracestate")
            .build();

        let candidates = config.carrier_candidates();
        let keys: Vec<_> = candidates
            .iter()
            .map(|c| (c.parent_key.as_str(), c.relationship))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("peer.io/traceparent", Relationship::Link),
                ("example.com/traceparent", Relationship::Parent),
                (
                    "operatortrace.azure.microsoft.com/traceparent",
                    Relationship::Parent
                ),
            ]
        );
    }

    #[test]
    fn test_derived_keys_track_prefix() {
        let config = builder().with_annotation_prefix("a.io").build();
        assert_eq!(config.legacy_trace_id_key(), "a.io/trace-id");
        assert_eq!(config.legacy_span_id_key(), "a.io/span-id");

        let keys = config.trace_annotation_keys();
        assert!(keys.contains(&"a.io/traceparent".to_string()));
        assert!(keys.contains(&"a.io/tracestate".to_string()));
        assert!(keys.contains(&"a.io/trace-id-time".to_string()));
        assert!(keys.contains(&config.default_traceparent_key()));
    }
}
